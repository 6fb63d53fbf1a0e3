use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::error::{StorageError, StorageResult};
use crate::types::{CompletedPart, StorageObject};

/// A place artifacts are stored: a local directory or an object-store bucket.
///
/// All implementations must satisfy these invariants:
/// - Paths are normalized before use; an empty path or one that resolves to
///   the root is rejected with [`StorageError::InvalidPath`].
/// - Every operation observes its cancellation token and returns
///   [`StorageError::Cancelled`] promptly once it fires. Partial effects of a
///   cancelled write are not rolled back.
/// - Absence of an object is reported as [`StorageError::NotFound`], never as
///   a generic I/O error.
/// - Implementations are shared across tasks behind an `Arc`.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short backend name used in log fields and error messages.
    fn name(&self) -> &'static str;

    /// Objects whose path starts with `prefix`. An empty prefix lists everything.
    async fn list(&self, cancel: &CancellationToken, prefix: &str) -> StorageResult<Vec<StorageObject>>;

    /// Stream the object at `path` into `writer`, returning the bytes copied.
    async fn read(
        &self,
        cancel: &CancellationToken,
        path: &str,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> StorageResult<u64>;

    async fn stat(&self, cancel: &CancellationToken, path: &str) -> StorageResult<StorageObject>;

    /// Create or replace the object at `path` from `reader`.
    ///
    /// `size` is advisory; backends consume the reader to its end and return
    /// the number of bytes actually stored.
    async fn write(
        &self,
        cancel: &CancellationToken,
        path: &str,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        size: u64,
    ) -> StorageResult<u64>;

    async fn delete(&self, cancel: &CancellationToken, path: &str) -> StorageResult<()>;

    /// Rename `from` to `to` within this backend.
    async fn move_object(&self, cancel: &CancellationToken, from: &str, to: &str) -> StorageResult<()>;

    /// Move `from` into another bucket (or root directory) under the name `to`.
    ///
    /// The source is removed only after the destination copy succeeded.
    async fn move_to_bucket(
        &self,
        cancel: &CancellationToken,
        from: &str,
        to: &str,
        bucket: &str,
    ) -> StorageResult<()>;

    /// Start a multipart upload and return its upload id.
    async fn initiate_multipart(&self, _cancel: &CancellationToken, _path: &str) -> StorageResult<String> {
        Err(self.unsupported("initiate_multipart"))
    }

    /// Upload part `part_number` (1-based) of an open multipart upload.
    async fn write_multipart(
        &self,
        _cancel: &CancellationToken,
        _path: &str,
        _upload_id: &str,
        _part_number: u32,
        _reader: &mut (dyn AsyncRead + Unpin + Send),
        _size: u64,
    ) -> StorageResult<CompletedPart> {
        Err(self.unsupported("write_multipart"))
    }

    /// Assemble `parts`. Backends that implement this reject parts that are
    /// not in non-decreasing part-number order.
    async fn complete_multipart(
        &self,
        _cancel: &CancellationToken,
        _path: &str,
        _upload_id: &str,
        _parts: &[CompletedPart],
    ) -> StorageResult<()> {
        Err(self.unsupported("complete_multipart"))
    }

    /// Discard an upload. Aborting an upload that no longer exists succeeds.
    async fn abort_multipart(&self, _cancel: &CancellationToken, _path: &str, _upload_id: &str) -> StorageResult<()> {
        Err(self.unsupported("abort_multipart"))
    }

    /// Returns `true` if an object exists at `path`.
    async fn exists(&self, cancel: &CancellationToken, path: &str) -> StorageResult<bool> {
        match self.stat(cancel, path).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    #[doc(hidden)]
    fn unsupported(&self, operation: &'static str) -> StorageError {
        StorageError::Unsupported {
            backend: self.name(),
            operation,
        }
    }
}
