//! Storage backends for parcel artifacts.
//!
//! Every backend implements the [`StorageBackend`] trait, so callers never
//! care whether artifacts live in a local directory or in an object-store
//! bucket.
//!
//! # Backends
//!
//! - [`FilesystemBackend`] -- files under a root directory, guarded by
//!   per-path reader/writer locks
//! - [`ObjectStoreBackend`] -- an S3-compatible bucket, with chunked parallel
//!   uploads for large writes and the explicit multipart protocol
//!
//! # Design Rules
//!
//! 1. Paths are normalized before use; empty and root paths are rejected.
//! 2. Every operation takes a cancellation token and returns
//!    [`StorageError::Cancelled`] promptly once it fires.
//! 3. A missing object is [`StorageError::NotFound`], on every backend.
//! 4. Errors carry the operation and path; nothing is logged in place of
//!    being returned.
//! 5. Aborting a multipart upload the provider no longer knows succeeds.

pub mod cancel;
pub mod config;
pub mod error;
pub mod fs;
pub mod locks;
pub mod s3;
pub mod traits;
pub mod types;

pub use cancel::with_cancel;
pub use config::BackendConfig;
pub use error::{StorageError, StorageResult};
pub use fs::FilesystemBackend;
pub use s3::{ListPage, ObjectStoreBackend, S3Config};
pub use traits::StorageBackend;
pub use types::{
    validate_part_order, CompletedPart, MultipartSession, StorageObject, DEFAULT_CHUNK_SIZE,
    MAX_MULTIPART_CHUNK_SIZE, MAX_PART_NUMBER, MIN_MULTIPART_CHUNK_SIZE,
};
