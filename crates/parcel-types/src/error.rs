use thiserror::Error;

/// Errors produced when a caller-supplied path cannot be used.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("path is empty")]
    Empty,

    #[error("path {0:?} resolves to the root")]
    ResolvesToRoot(String),
}

pub type PathResult<T> = Result<T, PathError>;
