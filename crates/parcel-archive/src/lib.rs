//! Artifact packaging for parcel.
//!
//! Files are staged into an in-memory [`VirtualTree`], serialized by the
//! [`ArchiveCodec`] into a single gzip-compressed tar stream, and carried
//! around as a named [`Artifact`].
//!
//! # Architecture
//!
//! - **VirtualTree**: owned directory/file hierarchy keyed by normalized paths
//! - **ArchiveCodec**: sequential (header, payload) encoder/decoder; decoding
//!   tolerates any entry order because missing ancestors are auto-created
//! - **Artifact**: name + tree, with staging from disk and extraction to disk
//!
//! # Design Rules
//!
//! 1. A tree is owned by exactly one artifact and is never shared across threads.
//! 2. Encoding is strictly sequential: header, payload, next header.
//! 3. Loading an artifact replaces its tree; it never merges.
//! 4. Extraction is not transactional: entries written before a failure stay on disk.

pub mod artifact;
pub mod codec;
pub mod error;
pub mod tree;

pub use artifact::{canonical_name, Artifact};
pub use codec::{ArchiveCodec, ARCHIVE_EXTENSION};
pub use error::{ArchiveError, ArchiveResult};
pub use tree::{DirNode, FileNode, Node, NodeRef, VirtualTree, Walk, DEFAULT_DIR_MODE, DEFAULT_FILE_MODE};
