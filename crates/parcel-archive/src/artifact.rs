//! Named artifacts: a [`VirtualTree`] plus a canonical `.tar.gz` name.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use parcel_types::VirtualPath;
use tracing::debug;
use walkdir::WalkDir;

use crate::codec::{ArchiveCodec, ARCHIVE_EXTENSION};
use crate::error::{ArchiveError, ArchiveResult};
use crate::tree::{NodeRef, VirtualTree, DEFAULT_FILE_MODE};

/// Append the archive extension to `name` unless it is already there.
pub fn canonical_name(name: &str) -> String {
    if name.ends_with(ARCHIVE_EXTENSION) {
        name.to_string()
    } else {
        format!("{name}{ARCHIVE_EXTENSION}")
    }
}

/// A named bundle of files, serializable to a single tar.gz stream.
///
/// The name is fixed at construction and is what identifies the artifact in a
/// storage backend.
#[derive(Clone, Debug)]
pub struct Artifact {
    name: String,
    tree: VirtualTree,
    codec: ArchiveCodec,
}

impl Artifact {
    /// Create an empty artifact.
    pub fn new(name: &str) -> Self {
        Self {
            name: canonical_name(name),
            tree: VirtualTree::new(),
            codec: ArchiveCodec::default(),
        }
    }

    /// Create an artifact and stage every file reachable from `paths`.
    ///
    /// A directory contributes each regular file beneath it at its path
    /// relative to that directory; a plain file is staged at the tree root.
    /// Symbolic links inside a directory are not followed.
    pub fn from_paths<P: AsRef<Path>>(name: &str, paths: &[P]) -> ArchiveResult<Self> {
        let mut artifact = Self::new(name);
        for path in paths {
            artifact.stage_path(path.as_ref())?;
        }
        debug!(
            artifact = %artifact.name,
            files = artifact.tree.file_count(),
            "staged artifact from disk"
        );
        Ok(artifact)
    }

    /// Decode an artifact from an encoded stream.
    pub fn from_reader<R: Read>(name: &str, reader: R) -> ArchiveResult<Self> {
        let mut artifact = Self::new(name);
        artifact.load_from_reader(reader)?;
        Ok(artifact)
    }

    /// Open an existing `.tar.gz` file. The artifact is named after the file.
    pub fn from_archive_file(path: &Path) -> ArchiveResult<Self> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !file_name.ends_with(ARCHIVE_EXTENSION) {
            return Err(ArchiveError::invalid_path(
                path.display().to_string(),
                format!("archive file name must end with {ARCHIVE_EXTENSION}"),
            ));
        }
        let file = fs::File::open(path).map_err(|e| read_error(path, e))?;
        Self::from_reader(&file_name, io::BufReader::new(file))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tree(&self) -> &VirtualTree {
        &self.tree
    }

    /// Stage `content` under the virtual directory `virtual_dir`, using the
    /// base name of `disk_path` as the file name.
    ///
    /// An empty `virtual_dir` means the tree root. Returns the path the file
    /// landed at.
    pub fn add_file(
        &mut self,
        virtual_dir: &str,
        disk_path: &Path,
        content: Vec<u8>,
    ) -> ArchiveResult<VirtualPath> {
        self.add_file_with_mode(virtual_dir, disk_path, content, DEFAULT_FILE_MODE)
    }

    fn add_file_with_mode(
        &mut self,
        virtual_dir: &str,
        disk_path: &Path,
        content: Vec<u8>,
        mode: u32,
    ) -> ArchiveResult<VirtualPath> {
        let base = disk_path.file_name().ok_or_else(|| {
            ArchiveError::invalid_path(disk_path.display().to_string(), "disk path has no file name")
        })?;
        let target = VirtualPath::new(virtual_dir).join(&base.to_string_lossy());
        self.tree.insert_with_mode(target.as_str(), content, mode)?;
        Ok(target)
    }

    fn stage_path(&mut self, path: &Path) -> ArchiveResult<()> {
        let meta = fs::metadata(path).map_err(|e| read_error(path, e))?;
        if !meta.is_dir() {
            let content = fs::read(path).map_err(|e| read_error(path, e))?;
            self.add_file_with_mode("", path, content, file_mode(&meta))?;
            return Ok(());
        }

        for entry in WalkDir::new(path).follow_links(false) {
            let entry = entry.map_err(|e| {
                let at = e.path().unwrap_or(path).to_path_buf();
                ArchiveError::ReadFailed {
                    path: at,
                    source: e.into(),
                }
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = match entry.path().strip_prefix(path) {
                Ok(rel) => rel,
                Err(_) => continue,
            };
            let virtual_dir = relative
                .parent()
                .map(VirtualPath::from_disk)
                .unwrap_or_default();
            let meta = entry.metadata().map_err(|e| ArchiveError::ReadFailed {
                path: entry.path().to_path_buf(),
                source: e.into(),
            })?;
            let content = fs::read(entry.path()).map_err(|e| read_error(entry.path(), e))?;
            self.add_file_with_mode(virtual_dir.as_str(), entry.path(), content, file_mode(&meta))?;
        }
        Ok(())
    }

    /// Every file path in walk order, relative to the root (`a/b.txt`).
    ///
    /// Directories are never included.
    pub fn list_files(&self) -> Vec<String> {
        self.tree
            .walk()
            .filter(|(_, node)| node.is_file())
            .map(|(path, _)| path.relative().to_string())
            .collect()
    }

    /// Recreate the tree under `output_dir`: every directory node becomes a
    /// directory (even if empty) and every file node a file.
    ///
    /// The first failing entry aborts the walk; entries already written stay.
    pub fn extract_to_directory(&self, output_dir: &Path) -> ArchiveResult<()> {
        for (path, node) in self.tree.walk() {
            let target = output_dir.join(path.relative());
            match node {
                NodeRef::Directory(_) => {
                    fs::create_dir_all(&target).map_err(|e| extraction_error(&target, e))?;
                }
                NodeRef::File(file) => {
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent).map_err(|e| extraction_error(parent, e))?;
                    }
                    fs::write(&target, file.data()).map_err(|e| extraction_error(&target, e))?;
                    set_file_mode(&target, file.mode())?;
                }
            }
        }
        debug!(artifact = %self.name, dir = %output_dir.display(), "artifact extracted");
        Ok(())
    }

    /// Encode the tree into `writer`.
    pub fn save_to_writer<W: Write>(&self, writer: W) -> ArchiveResult<W> {
        self.codec.encode(&self.tree, writer)
    }

    /// Encode the tree into a fresh buffer.
    pub fn to_bytes(&self) -> ArchiveResult<Vec<u8>> {
        self.save_to_writer(Vec::new())
    }

    /// Replace the tree with the contents decoded from `reader`.
    ///
    /// On failure the current tree is left untouched.
    pub fn load_from_reader<R: Read>(&mut self, reader: R) -> ArchiveResult<()> {
        self.tree = self.codec.decode(reader)?;
        Ok(())
    }
}

fn read_error(path: &Path, source: io::Error) -> ArchiveError {
    if source.kind() == io::ErrorKind::NotFound {
        ArchiveError::PathNotFound {
            path: path.to_path_buf(),
        }
    } else {
        ArchiveError::ReadFailed {
            path: path.to_path_buf(),
            source,
        }
    }
}

fn extraction_error(path: &Path, source: io::Error) -> ArchiveError {
    ArchiveError::ExtractionFailed {
        path: PathBuf::from(path),
        source,
    }
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_meta: &fs::Metadata) -> u32 {
    DEFAULT_FILE_MODE
}

#[cfg(unix)]
fn set_file_mode(path: &Path, mode: u32) -> ArchiveResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| extraction_error(path, e))
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path, _mode: u32) -> ArchiveResult<()> {
    Ok(())
}
