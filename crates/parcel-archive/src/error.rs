//! Error types for the archive crate.

use std::io;
use std::path::PathBuf;

/// Errors from tree staging, archive encoding/decoding, and extraction.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// A tree path was empty, resolved to the root, or collided with a node
    /// of the other kind.
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    /// A path handed to the bulk constructor does not exist on disk.
    #[error("path not found: {}", path.display())]
    PathNotFound { path: PathBuf },

    /// A file on disk exists but could not be read while staging.
    #[error("failed to read {}: {source}", path.display())]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The compressed stream or the archive inside it is malformed or truncated.
    #[error("corrupt archive: {reason}")]
    CorruptArchive { reason: String },

    /// Writing an entry to disk failed during extraction.
    #[error("extraction failed at {}: {source}", path.display())]
    ExtractionFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The output sink rejected bytes while encoding.
    #[error("failed to encode entry {path:?}: {source}")]
    Encode {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl ArchiveError {
    pub(crate) fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn corrupt(reason: impl std::fmt::Display) -> Self {
        Self::CorruptArchive {
            reason: reason.to_string(),
        }
    }
}

/// Convenience alias for archive results.
pub type ArchiveResult<T> = Result<T, ArchiveError>;
