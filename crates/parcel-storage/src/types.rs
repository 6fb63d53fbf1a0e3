use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::error::StorageResult;
use crate::traits::StorageBackend;

/// Minimum size of every multipart part except the last.
pub const MIN_MULTIPART_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Largest single part an object store accepts.
pub const MAX_MULTIPART_CHUNK_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Part size used by the chunked uploader unless configured otherwise.
pub const DEFAULT_CHUNK_SIZE: u64 = 10 * 1024 * 1024;

/// Highest part number an object store accepts.
pub const MAX_PART_NUMBER: u32 = 10_000;

/// Metadata for one stored object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageObject {
    /// Backend-relative path, without a leading slash.
    pub path: String,
    pub last_modified: DateTime<Utc>,
    /// Size in bytes.
    pub size: u64,
}

/// Receipt for one uploaded part of a multipart upload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
}

/// Caller-side bookkeeping for one multipart upload.
///
/// Parts may be uploaded from several tasks at once; each receipt is recorded
/// by part number, and [`complete`](Self::complete) submits them in order.
/// Recording the same part number twice keeps the later receipt.
#[derive(Debug)]
pub struct MultipartSession {
    path: String,
    upload_id: String,
    parts: Mutex<BTreeMap<u32, CompletedPart>>,
}

impl MultipartSession {
    /// Start a new multipart upload for `path`.
    pub async fn initiate(
        backend: &dyn StorageBackend,
        cancel: &CancellationToken,
        path: &str,
    ) -> StorageResult<Self> {
        let upload_id = backend.initiate_multipart(cancel, path).await?;
        Ok(Self {
            path: path.to_string(),
            upload_id,
            parts: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    /// Upload one part and record its receipt.
    pub async fn upload_part(
        &self,
        backend: &dyn StorageBackend,
        cancel: &CancellationToken,
        part_number: u32,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        size: u64,
    ) -> StorageResult<CompletedPart> {
        let part = backend
            .write_multipart(cancel, &self.path, &self.upload_id, part_number, reader, size)
            .await?;
        self.record(part.clone());
        Ok(part)
    }

    pub fn record(&self, part: CompletedPart) {
        self.lock_parts().insert(part.part_number, part);
    }

    /// Receipts recorded so far, in part-number order.
    pub fn completed_parts(&self) -> Vec<CompletedPart> {
        self.lock_parts().values().cloned().collect()
    }

    /// Assemble the recorded parts into the final object.
    pub async fn complete(&self, backend: &dyn StorageBackend, cancel: &CancellationToken) -> StorageResult<()> {
        let parts = self.completed_parts();
        backend
            .complete_multipart(cancel, &self.path, &self.upload_id, &parts)
            .await
    }

    /// Discard the upload and every part uploaded for it.
    pub async fn abort(&self, backend: &dyn StorageBackend, cancel: &CancellationToken) -> StorageResult<()> {
        backend.abort_multipart(cancel, &self.path, &self.upload_id).await
    }

    fn lock_parts(&self) -> std::sync::MutexGuard<'_, BTreeMap<u32, CompletedPart>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.parts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Check that `parts` are in non-decreasing part-number order.
pub fn validate_part_order(parts: &[CompletedPart]) -> StorageResult<()> {
    for pair in parts.windows(2) {
        if pair[1].part_number < pair[0].part_number {
            return Err(crate::StorageError::InvalidPartOrder {
                previous: pair[0].part_number,
                part: pair[1].part_number,
            });
        }
    }
    Ok(())
}
