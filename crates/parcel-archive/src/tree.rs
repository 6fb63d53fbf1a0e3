//! The in-memory virtual file tree.
//!
//! A [`VirtualTree`] maps normalized [`VirtualPath`]s to directory and file
//! nodes. Children are kept in a `BTreeMap`, so sibling names are unique and
//! every walk visits them in the same (lexical) order.
//!
//! The tree performs no locking. It is owned by a single artifact; callers
//! that stage from several threads must synchronize externally.

use std::collections::BTreeMap;

use parcel_types::VirtualPath;

use crate::error::{ArchiveError, ArchiveResult};

/// Mode given to files inserted without an explicit mode.
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Mode given to directories created implicitly as ancestors.
pub const DEFAULT_DIR_MODE: u32 = 0o755;

/// A directory node: permission bits plus its named children.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirNode {
    mode: u32,
    children: BTreeMap<String, Node>,
}

impl DirNode {
    fn new(mode: u32) -> Self {
        Self {
            mode,
            children: BTreeMap::new(),
        }
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    /// Children in name order.
    pub fn children(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.children.iter().map(|(name, node)| (name.as_str(), node))
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

/// A file node: permission bits plus its byte payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileNode {
    mode: u32,
    data: Vec<u8>,
}

impl FileNode {
    pub fn mode(&self) -> u32 {
        self.mode
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Payload size in bytes.
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// A child stored inside a directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Node {
    Directory(DirNode),
    File(FileNode),
}

impl Node {
    fn view(&self) -> NodeRef<'_> {
        match self {
            Node::Directory(dir) => NodeRef::Directory(dir),
            Node::File(file) => NodeRef::File(file),
        }
    }
}

/// Borrowed view of a node, including the root directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeRef<'a> {
    Directory(&'a DirNode),
    File(&'a FileNode),
}

impl NodeRef<'_> {
    pub fn is_dir(&self) -> bool {
        matches!(self, NodeRef::Directory(_))
    }

    pub fn is_file(&self) -> bool {
        matches!(self, NodeRef::File(_))
    }
}

/// An owned, in-memory hierarchy of directories and files.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VirtualTree {
    root: DirNode,
}

impl VirtualTree {
    /// Create an empty tree holding only the root directory.
    pub fn new() -> Self {
        Self {
            root: DirNode::new(DEFAULT_DIR_MODE),
        }
    }

    /// Create or overwrite the file at `path` with the default file mode.
    ///
    /// Missing ancestor directories are created.
    pub fn insert(&mut self, path: &str, data: Vec<u8>) -> ArchiveResult<()> {
        self.insert_with_mode(path, data, DEFAULT_FILE_MODE)
    }

    /// Create or overwrite the file at `path`.
    ///
    /// Fails with [`ArchiveError::InvalidPath`] if the path is empty, resolves
    /// to the root, crosses an existing file, or names an existing directory.
    pub fn insert_with_mode(&mut self, path: &str, data: Vec<u8>, mode: u32) -> ArchiveResult<()> {
        if path.trim().is_empty() {
            return Err(ArchiveError::invalid_path(path, "path is empty"));
        }
        let target = VirtualPath::new(path);
        let name = match target.file_name() {
            Some(name) => name.to_string(),
            None => return Err(ArchiveError::invalid_path(path, "path resolves to the root")),
        };

        let dir = self.dir_mut_creating(&target.parent(), &target)?;
        if let Some(Node::Directory(_)) = dir.children.get(&name) {
            return Err(ArchiveError::invalid_path(
                target.as_str(),
                "a directory already exists at this path",
            ));
        }
        dir.children.insert(name, Node::File(FileNode { mode, data }));
        Ok(())
    }

    /// Create the directory at `path` and all of its missing ancestors.
    ///
    /// The root always exists, so creating it is a no-op.
    pub fn create_dir_all(&mut self, path: &str) -> ArchiveResult<()> {
        self.create_dir_all_with_mode(path, DEFAULT_DIR_MODE)
    }

    /// Like [`create_dir_all`](Self::create_dir_all); `mode` applies to the
    /// leaf directory if this call creates it.
    pub fn create_dir_all_with_mode(&mut self, path: &str, mode: u32) -> ArchiveResult<()> {
        let target = VirtualPath::new(path);
        let name = match target.file_name() {
            Some(name) => name.to_string(),
            None => return Ok(()),
        };
        let parent = self.dir_mut_creating(&target.parent(), &target)?;
        match parent
            .children
            .entry(name)
            .or_insert_with(|| Node::Directory(DirNode::new(mode)))
        {
            Node::Directory(_) => Ok(()),
            Node::File(_) => Err(ArchiveError::invalid_path(
                target.as_str(),
                "a file already exists at this path",
            )),
        }
    }

    /// Walk (creating as needed) down to the directory `dir`.
    fn dir_mut_creating(&mut self, dir: &VirtualPath, target: &VirtualPath) -> ArchiveResult<&mut DirNode> {
        let mut current = &mut self.root;
        for segment in dir.segments() {
            let node = current
                .children
                .entry(segment.to_string())
                .or_insert_with(|| Node::Directory(DirNode::new(DEFAULT_DIR_MODE)));
            current = match node {
                Node::Directory(child) => child,
                Node::File(_) => {
                    return Err(ArchiveError::invalid_path(
                        target.as_str(),
                        format!("ancestor {segment:?} is a file"),
                    ))
                }
            };
        }
        Ok(current)
    }

    /// Look up the node at `path`. The root is always present.
    pub fn get(&self, path: &str) -> Option<NodeRef<'_>> {
        let target = VirtualPath::new(path);
        let mut current = NodeRef::Directory(&self.root);
        for segment in target.segments() {
            current = match current {
                NodeRef::Directory(dir) => dir.children.get(segment)?.view(),
                NodeRef::File(_) => return None,
            };
        }
        Some(current)
    }

    /// Look up the file at `path`.
    pub fn file(&self, path: &str) -> Option<&FileNode> {
        match self.get(path)? {
            NodeRef::File(file) => Some(file),
            NodeRef::Directory(_) => None,
        }
    }

    pub fn root(&self) -> &DirNode {
        &self.root
    }

    /// Number of file nodes anywhere in the tree.
    pub fn file_count(&self) -> usize {
        self.walk().filter(|(_, node)| node.is_file()).count()
    }

    /// Returns `true` if the root has no children.
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Drop every node except the root.
    pub fn clear(&mut self) {
        self.root.children.clear();
    }

    /// Depth-first, directory-before-children walk starting at the root.
    ///
    /// Every call starts a fresh walk.
    pub fn walk(&self) -> Walk<'_> {
        Walk {
            stack: vec![(VirtualPath::root(), NodeRef::Directory(&self.root))],
        }
    }
}

impl Default for VirtualTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Lazy pre-order iterator over a [`VirtualTree`].
#[derive(Debug)]
pub struct Walk<'a> {
    stack: Vec<(VirtualPath, NodeRef<'a>)>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = (VirtualPath, NodeRef<'a>);

    fn next(&mut self) -> Option<Self::Item> {
        let (path, node) = self.stack.pop()?;
        if let NodeRef::Directory(dir) = node {
            // Reverse so the smallest name is popped first.
            for (name, child) in dir.children.iter().rev() {
                self.stack.push((path.join(name), child.view()));
            }
        }
        Some((path, node))
    }
}
