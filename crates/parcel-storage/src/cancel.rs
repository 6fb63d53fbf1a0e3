use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::{StorageError, StorageResult};

/// Drive `operation` to completion unless `cancel` fires first.
///
/// A token that is already cancelled wins even if `operation` would be ready
/// on its first poll, so no work starts after cancellation.
pub async fn with_cancel<T, F>(cancel: &CancellationToken, operation: F) -> StorageResult<T>
where
    F: Future<Output = StorageResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StorageError::Cancelled),
        result = operation => result,
    }
}
