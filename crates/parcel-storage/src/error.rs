//! Error types for the storage crate.

use std::io;

use parcel_types::PathError;
use thiserror::Error;

/// Errors from storage backend operations.
///
/// Every variant that wraps an underlying failure records the operation and
/// the caller's path, so the message alone is enough to tell what failed where.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No object exists at the path.
    #[error("object not found: {path}")]
    NotFound { path: String },

    /// The backend cannot perform this operation at all.
    #[error("{operation} is not supported by the {backend} backend")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },

    /// The caller's cancellation token fired before the operation finished.
    #[error("operation cancelled")]
    Cancelled,

    /// The caller's path is empty or names the backend root.
    #[error("invalid path: {0}")]
    InvalidPath(#[from] PathError),

    /// Multipart part numbers must be within 1..=10000.
    #[error("invalid multipart part number {0}")]
    InvalidPartNumber(u32),

    /// Completed parts were not supplied in non-decreasing part-number order.
    #[error("multipart parts out of order: part {part} follows part {previous}")]
    InvalidPartOrder { previous: u32, part: u32 },

    /// Local or stream I/O failed.
    #[error("{operation} {path}: {source}")]
    Io {
        operation: &'static str,
        path: String,
        #[source]
        source: io::Error,
    },

    /// The HTTP request never produced a response.
    #[error("{operation} {path}: transport error: {source}")]
    Transport {
        operation: &'static str,
        path: String,
        #[source]
        source: reqwest::Error,
    },

    /// The object store answered with an error document.
    #[error("{operation} {path}: provider returned {status} {code}: {message}")]
    Provider {
        operation: &'static str,
        path: String,
        status: u16,
        code: String,
        message: String,
    },

    /// Backend configuration is incomplete or malformed.
    #[error("invalid storage configuration: {0}")]
    Config(String),
}

impl StorageError {
    pub(crate) fn io(operation: &'static str, path: &str, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            Self::NotFound {
                path: path.to_string(),
            }
        } else {
            Self::Io {
                operation,
                path: path.to_string(),
                source,
            }
        }
    }

    /// Returns `true` if the object was absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// The provider's error code, for errors reported by the object store.
    pub fn provider_code(&self) -> Option<&str> {
        match self {
            Self::Provider { code, .. } => Some(code),
            _ => None,
        }
    }
}

/// Convenience alias for storage results.
pub type StorageResult<T> = Result<T, StorageError>;
