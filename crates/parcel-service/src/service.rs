use std::path::{Path, PathBuf};
use std::sync::Arc;

use parcel_archive::{canonical_name, Artifact, ARCHIVE_EXTENSION};
use parcel_storage::{StorageBackend, StorageObject};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ServiceResult;

/// Largest buffer reserved up front for a download; the stat size is only a hint.
const MAX_PREALLOC: u64 = 64 * 1024 * 1024;

/// Summary of an artifact that was stored or retrieved.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ArtifactInfo {
    /// Canonical name, which is also the storage path.
    pub name: String,
    /// Encoded size in bytes.
    pub size: u64,
    /// Number of files in the artifact.
    pub files: usize,
}

/// Stores and retrieves artifacts through a [`StorageBackend`].
#[derive(Clone)]
pub struct ArtifactService {
    backend: Arc<dyn StorageBackend>,
}

impl ArtifactService {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &dyn StorageBackend {
        self.backend.as_ref()
    }

    /// Encode `artifact` and write it under its name, replacing any previous
    /// artifact of that name.
    pub async fn upload(&self, cancel: &CancellationToken, artifact: &Artifact) -> ServiceResult<ArtifactInfo> {
        let encoded = artifact.to_bytes()?;
        self.store_encoded(cancel, artifact.name(), encoded, artifact.tree().file_count())
            .await
    }

    async fn store_encoded(
        &self,
        cancel: &CancellationToken,
        name: &str,
        encoded: Vec<u8>,
        files: usize,
    ) -> ServiceResult<ArtifactInfo> {
        let mut reader = encoded.as_slice();
        let size = self
            .backend
            .write(cancel, name, &mut reader, encoded.len() as u64)
            .await?;
        debug!(artifact = name, bytes = size, files, backend = self.backend.name(), "uploaded artifact");
        Ok(ArtifactInfo {
            name: name.to_string(),
            size,
            files,
        })
    }

    /// Fetch and decode the artifact called `name`.
    ///
    /// The object is stat'ed first so a missing artifact fails with
    /// `NotFound` before any transfer starts.
    pub async fn download(&self, cancel: &CancellationToken, name: &str) -> ServiceResult<Artifact> {
        Ok(self.fetch(cancel, name).await?.0)
    }

    async fn fetch(&self, cancel: &CancellationToken, name: &str) -> ServiceResult<(Artifact, u64)> {
        let name = canonical_name(name);
        let object = self.backend.stat(cancel, &name).await?;
        let mut encoded = Vec::with_capacity(object.size.min(MAX_PREALLOC) as usize);
        let size = self.backend.read(cancel, &name, &mut encoded).await?;
        debug!(artifact = %name, bytes = size, backend = self.backend.name(), "downloaded artifact");

        let artifact = tokio::task::spawn_blocking(move || Artifact::from_reader(&name, encoded.as_slice())).await??;
        Ok((artifact, size))
    }

    pub async fn delete(&self, cancel: &CancellationToken, name: &str) -> ServiceResult<()> {
        let name = canonical_name(name);
        self.backend.delete(cancel, &name).await?;
        debug!(artifact = %name, "deleted artifact");
        Ok(())
    }

    pub async fn exists(&self, cancel: &CancellationToken, name: &str) -> ServiceResult<bool> {
        Ok(self.backend.exists(cancel, &canonical_name(name)).await?)
    }

    /// Stored artifacts whose name starts with `prefix`. Objects that are not
    /// archives are skipped.
    pub async fn list(&self, cancel: &CancellationToken, prefix: &str) -> ServiceResult<Vec<StorageObject>> {
        let mut objects = self.backend.list(cancel, prefix).await?;
        objects.retain(|object| object.path.ends_with(ARCHIVE_EXTENSION));
        Ok(objects)
    }

    /// Stage `paths` from disk into an artifact called `name` and upload it.
    pub async fn push_paths(
        &self,
        cancel: &CancellationToken,
        name: &str,
        paths: Vec<PathBuf>,
    ) -> ServiceResult<ArtifactInfo> {
        let name = canonical_name(name);
        let staging_name = name.clone();
        let (encoded, files) = tokio::task::spawn_blocking(move || {
            let artifact = Artifact::from_paths(&staging_name, &paths)?;
            let files = artifact.tree().file_count();
            artifact.to_bytes().map(|encoded| (encoded, files))
        })
        .await??;
        self.store_encoded(cancel, &name, encoded, files).await
    }

    /// Download the artifact called `name` and extract it beneath `dest`.
    pub async fn pull_to_directory(
        &self,
        cancel: &CancellationToken,
        name: &str,
        dest: &Path,
    ) -> ServiceResult<ArtifactInfo> {
        let (artifact, size) = self.fetch(cancel, name).await?;
        let dest = dest.to_path_buf();
        let info = tokio::task::spawn_blocking(move || {
            artifact.extract_to_directory(&dest)?;
            Ok::<_, parcel_archive::ArchiveError>(ArtifactInfo {
                name: artifact.name().to_string(),
                size,
                files: artifact.tree().file_count(),
            })
        })
        .await??;
        debug!(artifact = %info.name, files = info.files, "extracted artifact");
        Ok(info)
    }
}
