//! Virtual path normalization.
//!
//! Normalized form rules:
//! - Always absolute from the root (`/`), slash-separated
//! - No empty segments (`a//b` becomes `/a/b`)
//! - No `.` segments, and `..` removes the previous segment
//! - `..` at the root is absorbed (`/../a` becomes `/a`), so a path can never
//!   climb above the root it is resolved against

use std::fmt;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

use crate::error::{PathError, PathResult};

/// An absolute, normalized, slash-separated path inside a virtual namespace.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct VirtualPath(String);

impl VirtualPath {
    /// The root path, `/`.
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// Normalize an arbitrary slash-separated path.
    ///
    /// Backslashes are treated as separators too, so paths captured on Windows
    /// hosts normalize to the same value.
    pub fn new(path: &str) -> Self {
        let mut segments: Vec<&str> = Vec::new();
        for segment in path.split(['/', '\\']) {
            match segment {
                "" | "." => {}
                ".." => {
                    segments.pop();
                }
                s => segments.push(s),
            }
        }
        Self::from_segments(segments)
    }

    /// Build a virtual path from a relative on-disk path.
    ///
    /// Root and drive-prefix components are dropped; only the normal
    /// components (after resolving `.`/`..`) survive.
    pub fn from_disk(path: &Path) -> Self {
        let mut segments: Vec<String> = Vec::new();
        for component in path.components() {
            match component {
                Component::Normal(part) => segments.push(part.to_string_lossy().into_owned()),
                Component::ParentDir => {
                    segments.pop();
                }
                Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            }
        }
        Self::from_segments(segments.iter().map(String::as_str))
    }

    fn from_segments<'a>(segments: impl IntoIterator<Item = &'a str>) -> Self {
        let mut out = String::from("/");
        for (i, segment) in segments.into_iter().enumerate() {
            if i > 0 {
                out.push('/');
            }
            out.push_str(segment);
        }
        Self(out)
    }

    /// The normalized absolute form, e.g. `/a/c.txt`.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The same path without its leading slash, e.g. `a/c.txt`. Empty for the root.
    pub fn relative(&self) -> &str {
        &self.0[1..]
    }

    pub fn is_root(&self) -> bool {
        self.0.len() == 1
    }

    /// Iterate over the path's segments, root first.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.relative().split('/').filter(|s| !s.is_empty())
    }

    /// The final segment, or `None` for the root.
    pub fn file_name(&self) -> Option<&str> {
        if self.is_root() {
            None
        } else {
            self.0.rsplit('/').next()
        }
    }

    /// The containing directory. The parent of the root is the root.
    pub fn parent(&self) -> VirtualPath {
        match self.0.rfind('/') {
            Some(0) | None => Self::root(),
            Some(idx) => Self(self.0[..idx].to_string()),
        }
    }

    /// Append `child` (which may itself contain separators) and renormalize.
    pub fn join(&self, child: &str) -> VirtualPath {
        Self::new(&format!("{}/{}", self.0, child))
    }
}

impl Default for VirtualPath {
    fn default() -> Self {
        Self::root()
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VirtualPath {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<String> for VirtualPath {
    fn from(path: String) -> Self {
        Self::new(&path)
    }
}

impl From<VirtualPath> for String {
    fn from(path: VirtualPath) -> Self {
        path.0
    }
}

/// Turn a caller path into a backend-relative object key (`a/b.txt`).
///
/// Fails if the path is empty or normalizes to the root, since neither names
/// an object.
pub fn storage_key(path: &str) -> PathResult<String> {
    if path.trim().is_empty() {
        return Err(PathError::Empty);
    }
    let normalized = VirtualPath::new(path);
    if normalized.is_root() {
        return Err(PathError::ResolvesToRoot(path.to_string()));
    }
    Ok(normalized.relative().to_string())
}

/// Turn a caller listing prefix into a backend-relative prefix.
///
/// Unlike [`storage_key`], the empty prefix is valid (it matches everything),
/// and a trailing slash is kept so that `docs/` does not match `docs2/x`.
pub fn storage_prefix(prefix: &str) -> String {
    let normalized = VirtualPath::new(prefix);
    if normalized.is_root() {
        return String::new();
    }
    let mut out = normalized.relative().to_string();
    if prefix.ends_with('/') || prefix.ends_with('\\') {
        out.push('/');
    }
    out
}
