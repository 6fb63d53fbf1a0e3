//! gzip-compressed tar encoding of a [`VirtualTree`].
//!
//! Wire format:
//! ```text
//! gzip(
//!   [tar header: relative path, type flag, mode, size][payload, padded to 512]
//!   ...
//!   [end-of-archive: two zero blocks]
//! )
//! ```
//!
//! Files are written in walk order. Directories are implied by the paths of
//! the files beneath them; only empty directories get an explicit directory
//! header. Decoding accepts entries in any order.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parcel_types::VirtualPath;
use tar::{Builder, EntryType, Header};
use tracing::debug;

use crate::error::{ArchiveError, ArchiveResult};
use crate::tree::{NodeRef, VirtualTree, DEFAULT_DIR_MODE, DEFAULT_FILE_MODE};

/// File extension every encoded artifact carries.
pub const ARCHIVE_EXTENSION: &str = ".tar.gz";

/// Upper bound on the up-front buffer reservation for one entry; the header's
/// size field is untrusted until the payload has actually been read.
const MAX_PREALLOC: u64 = 1 << 20;

/// Serializes trees to, and rebuilds trees from, tar.gz streams.
#[derive(Clone, Copy, Debug)]
pub struct ArchiveCodec {
    level: Compression,
}

impl Default for ArchiveCodec {
    fn default() -> Self {
        Self {
            level: Compression::default(),
        }
    }
}

impl ArchiveCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an explicit gzip level (0 = store, 9 = best).
    pub fn with_level(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }

    /// Encode `tree` into `writer`, returning the writer once the gzip trailer
    /// has been flushed.
    pub fn encode<W: Write>(&self, tree: &VirtualTree, writer: W) -> ArchiveResult<W> {
        let mut builder = Builder::new(GzEncoder::new(writer, self.level));
        let mut entries = 0usize;

        for (path, node) in tree.walk() {
            if path.is_root() {
                continue;
            }
            let name = path.relative();
            let mut header = Header::new_gnu();
            header.set_mtime(0);
            match node {
                NodeRef::File(file) => {
                    header.set_entry_type(EntryType::Regular);
                    header.set_mode(file.mode());
                    header.set_size(file.size());
                    builder
                        .append_data(&mut header, name, file.data())
                        .map_err(|source| ArchiveError::Encode {
                            path: name.to_string(),
                            source,
                        })?;
                }
                NodeRef::Directory(dir) if dir.is_empty() => {
                    header.set_entry_type(EntryType::Directory);
                    header.set_mode(dir.mode());
                    header.set_size(0);
                    builder
                        .append_data(&mut header, name, std::io::empty())
                        .map_err(|source| ArchiveError::Encode {
                            path: name.to_string(),
                            source,
                        })?;
                }
                NodeRef::Directory(_) => continue,
            }
            entries += 1;
        }

        let encoder = builder.into_inner().map_err(|source| ArchiveError::Encode {
            path: "<end-of-archive>".into(),
            source,
        })?;
        let writer = encoder.finish().map_err(|source| ArchiveError::Encode {
            path: "<gzip trailer>".into(),
            source,
        })?;
        debug!(entries, "archive encoded");
        Ok(writer)
    }

    /// Decode a stream into a fresh tree.
    pub fn decode<R: Read>(&self, reader: R) -> ArchiveResult<VirtualTree> {
        let mut tree = VirtualTree::new();
        let mut archive = tar::Archive::new(GzDecoder::new(reader));
        let entries = archive.entries().map_err(ArchiveError::corrupt)?;

        let mut decoded = 0usize;
        for entry in entries {
            let mut entry = entry.map_err(ArchiveError::corrupt)?;
            let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
            let path = VirtualPath::new(&name);
            if path.is_root() {
                continue;
            }
            let header = entry.header();
            let size = header.size().map_err(ArchiveError::corrupt)?;
            let entry_type = header.entry_type();

            match entry_type {
                EntryType::Directory => {
                    let mode = header.mode().unwrap_or(DEFAULT_DIR_MODE);
                    tree.create_dir_all_with_mode(path.as_str(), mode)
                        .map_err(ArchiveError::corrupt)?;
                }
                EntryType::Regular | EntryType::Continuous => {
                    let mode = header.mode().unwrap_or(DEFAULT_FILE_MODE);
                    let mut data = Vec::with_capacity(size.min(MAX_PREALLOC) as usize);
                    entry
                        .read_to_end(&mut data)
                        .map_err(ArchiveError::corrupt)?;
                    if data.len() as u64 != size {
                        return Err(ArchiveError::corrupt(format!(
                            "entry {name:?} truncated: header says {size} bytes, read {}",
                            data.len()
                        )));
                    }
                    tree.insert_with_mode(path.as_str(), data, mode)
                        .map_err(ArchiveError::corrupt)?;
                }
                other => {
                    debug!(entry = %name, kind = ?other, "skipping unsupported archive entry");
                    continue;
                }
            }
            decoded += 1;
        }

        debug!(entries = decoded, "archive decoded");
        Ok(tree)
    }
}
