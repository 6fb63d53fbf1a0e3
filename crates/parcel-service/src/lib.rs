//! Artifact service for parcel.
//!
//! [`ArtifactService`] joins the two halves of the system: it encodes
//! [`Artifact`]s with the archive codec and moves the bytes through whichever
//! [`StorageBackend`] it was given. Artifacts are stored under their canonical
//! `.tar.gz` name.

pub mod error;
pub mod service;

pub use error::{ServiceError, ServiceResult};
pub use service::{ArtifactInfo, ArtifactService};

// Re-export key types
pub use parcel_archive::{canonical_name, Artifact};
pub use parcel_storage::{BackendConfig, StorageBackend, StorageObject};
