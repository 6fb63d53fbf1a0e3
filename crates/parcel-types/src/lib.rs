//! Foundation types for parcel.
//!
//! Every other parcel crate depends on `parcel-types` for one thing: a single,
//! shared notion of what a path looks like once it has been normalized. The
//! in-memory tree and both storage backends agree on these rules, so a path
//! staged into an artifact and a key written through a backend can never
//! disagree about `.`/`..` segments or doubled separators.
//!
//! # Key Types
//!
//! - [`VirtualPath`] -- absolute, slash-separated, `.`/`..`-free path
//! - [`storage_key`] -- backend-relative key derived from a caller path

pub mod error;
pub mod path;

pub use error::{PathError, PathResult};
pub use path::{storage_key, storage_prefix, VirtualPath};
