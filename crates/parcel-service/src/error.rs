use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("archive error: {0}")]
    Archive(#[from] parcel_archive::ArchiveError),

    #[error("storage error: {0}")]
    Storage(#[from] parcel_storage::StorageError),

    /// A blocking archive task panicked or was cancelled by the runtime.
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ServiceError {
    /// Returns `true` if the named artifact does not exist in the backend.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Storage(e) if e.is_not_found())
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
