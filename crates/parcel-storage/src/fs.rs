//! Local-directory backend.
//!
//! Objects are plain files under a root directory; the object path is the
//! file's path relative to the root. Every operation holds the per-path lock
//! for its key: reads and listings share it, writes, deletes and moves take
//! it exclusively. Multipart uploads are not supported.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parcel_types::{storage_key, storage_prefix, VirtualPath};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use walkdir::WalkDir;

use crate::cancel::with_cancel;
use crate::error::{StorageError, StorageResult};
use crate::locks::PathLocks;
use crate::traits::StorageBackend;
use crate::types::StorageObject;

const BACKEND: &str = "filesystem";

/// Stores objects as files beneath a root directory.
#[derive(Debug)]
pub struct FilesystemBackend {
    root: PathBuf,
    locks: PathLocks,
}

impl FilesystemBackend {
    /// The root does not need to exist yet; writes create directories on demand.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: PathLocks::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of paths with a live lock entry.
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    /// Release lock entries for paths no operation currently holds.
    ///
    /// The lock table otherwise grows by one entry per distinct path touched.
    pub fn compact_locks(&self) -> usize {
        let removed = self.locks.compact();
        debug!(backend = BACKEND, removed, remaining = self.locks.len(), "compacted path locks");
        removed
    }

    fn resolve(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

fn modified(meta: &std::fs::Metadata) -> DateTime<Utc> {
    meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now())
}

/// Metadata for the regular file at `full`; directories count as absent.
async fn file_metadata(operation: &'static str, key: &str, full: &Path) -> StorageResult<std::fs::Metadata> {
    let meta = tokio::fs::metadata(full)
        .await
        .map_err(|e| StorageError::io(operation, key, e))?;
    if !meta.is_file() {
        return Err(StorageError::NotFound { path: key.to_string() });
    }
    Ok(meta)
}

async fn create_parent(operation: &'static str, key: &str, full: &Path) -> StorageResult<()> {
    if let Some(parent) = full.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StorageError::io(operation, key, e))?;
    }
    Ok(())
}

/// Walk the directory named by the prefix and keep files matching it lexically.
fn scan(root: &Path, prefix: &str) -> StorageResult<Vec<StorageObject>> {
    let dir = match prefix.rfind('/') {
        Some(idx) => &prefix[..idx],
        None => "",
    };
    let base = root.join(dir);
    if !base.is_dir() {
        return Ok(Vec::new());
    }

    let mut objects = Vec::new();
    for entry in WalkDir::new(&base).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            // Removed by a concurrent delete after the walk saw it.
            Err(e) if e.io_error().map(io::Error::kind) == Some(io::ErrorKind::NotFound) => continue,
            Err(e) => return Err(StorageError::io("list", prefix, e.into())),
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let path = VirtualPath::from_disk(relative).relative().to_string();
        if !path.starts_with(prefix) {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(e) if e.io_error().map(io::Error::kind) == Some(io::ErrorKind::NotFound) => continue,
            Err(e) => return Err(StorageError::io("list", &path, e.into())),
        };
        objects.push(StorageObject {
            path,
            last_modified: modified(&meta),
            size: meta.len(),
        });
    }
    objects.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(objects)
}

#[async_trait]
impl StorageBackend for FilesystemBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn list(&self, cancel: &CancellationToken, prefix: &str) -> StorageResult<Vec<StorageObject>> {
        let prefix = storage_prefix(prefix);
        with_cancel(cancel, async {
            let _guard = self.locks.read(&prefix).await;
            let root = self.root.clone();
            let scan_prefix = prefix.clone();
            let objects = tokio::task::spawn_blocking(move || scan(&root, &scan_prefix))
                .await
                .map_err(|e| StorageError::io("list", &prefix, io::Error::other(e)))??;
            debug!(backend = BACKEND, prefix = %prefix, count = objects.len(), "listed objects");
            Ok(objects)
        })
        .await
    }

    async fn read(
        &self,
        cancel: &CancellationToken,
        path: &str,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> StorageResult<u64> {
        let key = storage_key(path)?;
        with_cancel(cancel, async {
            let _guard = self.locks.read(&key).await;
            let full = self.resolve(&key);
            file_metadata("read", &key, &full).await?;
            let mut file = tokio::fs::File::open(&full)
                .await
                .map_err(|e| StorageError::io("read", &key, e))?;
            let copied = tokio::io::copy(&mut file, writer)
                .await
                .map_err(|e| StorageError::io("read", &key, e))?;
            writer.flush().await.map_err(|e| StorageError::io("read", &key, e))?;
            debug!(backend = BACKEND, path = %key, bytes = copied, "read object");
            Ok(copied)
        })
        .await
    }

    async fn stat(&self, cancel: &CancellationToken, path: &str) -> StorageResult<StorageObject> {
        let key = storage_key(path)?;
        with_cancel(cancel, async {
            let _guard = self.locks.read(&key).await;
            let meta = file_metadata("stat", &key, &self.resolve(&key)).await?;
            Ok(StorageObject {
                path: key.clone(),
                last_modified: modified(&meta),
                size: meta.len(),
            })
        })
        .await
    }

    async fn write(
        &self,
        cancel: &CancellationToken,
        path: &str,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        size: u64,
    ) -> StorageResult<u64> {
        let key = storage_key(path)?;
        with_cancel(cancel, async {
            let _guard = self.locks.write(&key).await;
            let full = self.resolve(&key);
            create_parent("write", &key, &full).await?;
            let mut file = tokio::fs::File::create(&full)
                .await
                .map_err(|e| StorageError::io("write", &key, e))?;
            let written = tokio::io::copy(reader, &mut file)
                .await
                .map_err(|e| StorageError::io("write", &key, e))?;
            file.flush().await.map_err(|e| StorageError::io("write", &key, e))?;
            if written != size {
                debug!(backend = BACKEND, path = %key, declared = size, written, "size hint differed from bytes written");
            }
            debug!(backend = BACKEND, path = %key, bytes = written, "wrote object");
            Ok(written)
        })
        .await
    }

    async fn delete(&self, cancel: &CancellationToken, path: &str) -> StorageResult<()> {
        let key = storage_key(path)?;
        with_cancel(cancel, async {
            let _guard = self.locks.write(&key).await;
            let full = self.resolve(&key);
            file_metadata("delete", &key, &full).await?;
            tokio::fs::remove_file(&full)
                .await
                .map_err(|e| StorageError::io("delete", &key, e))?;
            debug!(backend = BACKEND, path = %key, "deleted object");
            Ok(())
        })
        .await
    }

    async fn move_object(&self, cancel: &CancellationToken, from: &str, to: &str) -> StorageResult<()> {
        let src = storage_key(from)?;
        let dst = storage_key(to)?;
        with_cancel(cancel, async {
            let _guard = self.locks.write_pair(&src, &dst).await;
            let src_path = self.resolve(&src);
            let dst_path = self.resolve(&dst);
            file_metadata("move", &src, &src_path).await?;
            create_parent("move", &dst, &dst_path).await?;
            tokio::fs::rename(&src_path, &dst_path)
                .await
                .map_err(|e| StorageError::io("move", &src, e))?;
            debug!(backend = BACKEND, from = %src, to = %dst, "moved object");
            Ok(())
        })
        .await
    }

    async fn move_to_bucket(
        &self,
        cancel: &CancellationToken,
        from: &str,
        to: &str,
        bucket: &str,
    ) -> StorageResult<()> {
        if bucket.trim().is_empty() {
            return Err(StorageError::Config("destination bucket is empty".into()));
        }
        let src = storage_key(from)?;
        let dst = storage_key(to)?;
        // Keys in the other root live in their own namespace of this lock table.
        let dst_lock = format!("{bucket}\0{dst}");
        with_cancel(cancel, async {
            let _guard = self.locks.write_pair(&src, &dst_lock).await;
            let src_path = self.resolve(&src);
            let dst_path = Path::new(bucket).join(&dst);
            file_metadata("move_to_bucket", &src, &src_path).await?;
            create_parent("move_to_bucket", &dst, &dst_path).await?;
            tokio::fs::copy(&src_path, &dst_path)
                .await
                .map_err(|e| StorageError::io("move_to_bucket", &src, e))?;
            tokio::fs::remove_file(&src_path)
                .await
                .map_err(|e| StorageError::io("move_to_bucket", &src, e))?;
            debug!(backend = BACKEND, from = %src, to = %dst, bucket, "moved object to bucket");
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use crate::types::CompletedPart;
    use tempfile::TempDir;

    async fn put(backend: &FilesystemBackend, path: &str, data: &[u8]) {
        let cancel = CancellationToken::new();
        let mut reader = data;
        backend
            .write(&cancel, path, &mut reader, data.len() as u64)
            .await
            .unwrap();
    }

    async fn get(backend: &FilesystemBackend, path: &str) -> StorageResult<Vec<u8>> {
        let mut out = Vec::new();
        backend.read(&CancellationToken::new(), path, &mut out).await?;
        Ok(out)
    }

    fn paths(objects: &[StorageObject]) -> Vec<&str> {
        objects.iter().map(|o| o.path.as_str()).collect()
    }

    #[tokio::test]
    async fn write_read_stat_roundtrip() {
        let dir = TempDir::new().unwrap();
        let backend = FilesystemBackend::new(dir.path());
        put(&backend, "nested/deep/file.bin", b"payload").await;

        assert_eq!(get(&backend, "/nested/deep/file.bin").await.unwrap(), b"payload");
        let stat = backend
            .stat(&CancellationToken::new(), "nested/deep/file.bin")
            .await
            .unwrap();
        assert_eq!(stat.path, "nested/deep/file.bin");
        assert_eq!(stat.size, 7);
        assert!(dir.path().join("nested/deep/file.bin").is_file());
    }

    #[tokio::test]
    async fn paths_are_normalized() {
        let dir = TempDir::new().unwrap();
        let backend = FilesystemBackend::new(dir.path());
        put(&backend, "a//b/../c.txt", b"x").await;
        assert_eq!(get(&backend, "a/c.txt").await.unwrap(), b"x");
        // `..` cannot climb out of the root.
        put(&backend, "../../escape.txt", b"y").await;
        assert!(dir.path().join("escape.txt").is_file());
    }

    #[tokio::test]
    async fn invalid_paths_rejected() {
        let dir = TempDir::new().unwrap();
        let backend = FilesystemBackend::new(dir.path());
        let cancel = CancellationToken::new();
        for bad in ["", "/", "a/.."] {
            let err = backend.write(&cancel, bad, &mut &b"x"[..], 1).await.unwrap_err();
            assert!(matches!(err, StorageError::InvalidPath(_)), "{bad:?}: {err}");
        }
    }

    #[tokio::test]
    async fn missing_objects_are_not_found() {
        let dir = TempDir::new().unwrap();
        let backend = FilesystemBackend::new(dir.path());
        let cancel = CancellationToken::new();
        put(&backend, "dir/inner.txt", b"x").await;

        assert!(get(&backend, "nope").await.unwrap_err().is_not_found());
        assert!(backend.stat(&cancel, "nope").await.unwrap_err().is_not_found());
        assert!(backend.delete(&cancel, "nope").await.unwrap_err().is_not_found());
        // A directory is not an object.
        assert!(backend.stat(&cancel, "dir").await.unwrap_err().is_not_found());
        assert!(!backend.exists(&cancel, "nope").await.unwrap());
        assert!(backend.exists(&cancel, "dir/inner.txt").await.unwrap());
    }

    #[tokio::test]
    async fn list_matches_prefix_lexically() {
        let dir = TempDir::new().unwrap();
        let backend = FilesystemBackend::new(dir.path());
        let cancel = CancellationToken::new();
        for path in ["docs/a.txt", "docs/sub/b.txt", "docs2/c.txt", "top.txt"] {
            put(&backend, path, b"x").await;
        }

        let all = backend.list(&cancel, "").await.unwrap();
        assert_eq!(paths(&all), vec!["docs/a.txt", "docs/sub/b.txt", "docs2/c.txt", "top.txt"]);

        let docs = backend.list(&cancel, "docs/").await.unwrap();
        assert_eq!(paths(&docs), vec!["docs/a.txt", "docs/sub/b.txt"]);

        let loose = backend.list(&cancel, "doc").await.unwrap();
        assert_eq!(loose.len(), 3);

        assert!(backend.list(&cancel, "missing/dir/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_removes_object() {
        let dir = TempDir::new().unwrap();
        let backend = FilesystemBackend::new(dir.path());
        put(&backend, "gone.txt", b"x").await;
        backend.delete(&CancellationToken::new(), "gone.txt").await.unwrap();
        assert!(get(&backend, "gone.txt").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn move_renames_within_root() {
        let dir = TempDir::new().unwrap();
        let backend = FilesystemBackend::new(dir.path());
        let cancel = CancellationToken::new();
        put(&backend, "src.txt", b"moving").await;

        backend.move_object(&cancel, "src.txt", "dst/dir/moved.txt").await.unwrap();
        assert_eq!(get(&backend, "dst/dir/moved.txt").await.unwrap(), b"moving");
        assert!(get(&backend, "src.txt").await.unwrap_err().is_not_found());

        let err = backend.move_object(&cancel, "src.txt", "x").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn move_to_bucket_uses_other_root() {
        let dir = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        let backend = FilesystemBackend::new(dir.path());
        put(&backend, "a.txt", b"across").await;

        backend
            .move_to_bucket(
                &CancellationToken::new(),
                "a.txt",
                "in/other.txt",
                other.path().to_str().unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(std::fs::read(other.path().join("in/other.txt")).unwrap(), b"across");
        assert!(!dir.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn failed_bucket_copy_leaves_source() {
        let dir = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        // A regular file where the destination root should be a directory.
        let blocked = scratch.path().join("not-a-dir");
        std::fs::write(&blocked, b"x").unwrap();
        let backend = FilesystemBackend::new(dir.path());
        put(&backend, "a.txt", b"keep me").await;

        let err = backend
            .move_to_bucket(
                &CancellationToken::new(),
                "a.txt",
                "in/other.txt",
                blocked.to_str().unwrap(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Io { .. }), "{err}");
        assert_eq!(get(&backend, "a.txt").await.unwrap(), b"keep me");
    }

    #[tokio::test]
    async fn multipart_is_unsupported() {
        let dir = TempDir::new().unwrap();
        let backend = FilesystemBackend::new(dir.path());
        let cancel = CancellationToken::new();

        let err = backend.initiate_multipart(&cancel, "big.bin").await.unwrap_err();
        assert!(matches!(err, StorageError::Unsupported { backend: "filesystem", .. }));
        let err = backend
            .write_multipart(&cancel, "big.bin", "id", 1, &mut &b"x"[..], 1)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Unsupported { .. }));
        let err = backend.abort_multipart(&cancel, "big.bin", "id").await.unwrap_err();
        assert!(matches!(err, StorageError::Unsupported { .. }));
        let err = backend
            .complete_multipart(&cancel, "big.bin", "id", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Unsupported { .. }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn complete_with_misordered_parts_is_still_unsupported() {
        let dir = TempDir::new().unwrap();
        let backend = FilesystemBackend::new(dir.path());
        let parts = [
            CompletedPart { part_number: 2, etag: "\"b\"".into(), size: 1 },
            CompletedPart { part_number: 1, etag: "\"a\"".into(), size: 1 },
        ];
        let err = backend
            .complete_multipart(&CancellationToken::new(), "big.bin", "id", &parts)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Unsupported { operation: "complete_multipart", .. }), "{err}");
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_writing() {
        let dir = TempDir::new().unwrap();
        let backend = FilesystemBackend::new(dir.path());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = backend.write(&cancel, "f.txt", &mut &b"x"[..], 1).await.unwrap_err();
        assert!(matches!(err, StorageError::Cancelled));
        assert!(!dir.path().join("f.txt").exists());
    }

    #[tokio::test]
    async fn stalled_writer_blocks_only_its_path() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(FilesystemBackend::new(dir.path()));
        let cancel = CancellationToken::new();

        // The sender stays open and silent, so this write never finishes.
        let (_tx, mut rx) = tokio::io::duplex(64);
        let stalled = {
            let backend = Arc::clone(&backend);
            let cancel = cancel.clone();
            tokio::spawn(async move { backend.write(&cancel, "a.bin", &mut rx, 0).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(
            Duration::from_secs(1),
            backend.write(&cancel, "b.bin", &mut &b"ok"[..], 2),
        )
        .await
        .unwrap()
        .unwrap();

        let mut sink = Vec::new();
        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            backend.read(&cancel, "a.bin", &mut sink),
        )
        .await;
        assert!(blocked.is_err());

        cancel.cancel();
        let result = stalled.await.unwrap();
        assert!(matches!(result, Err(StorageError::Cancelled)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_never_interleave() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(FilesystemBackend::new(dir.path()));
        const LEN: usize = 512 * 1024;

        for _ in 0..4 {
            let mut tasks = Vec::new();
            for byte in [b'a', b'b'] {
                let backend = Arc::clone(&backend);
                tasks.push(tokio::spawn(async move {
                    let data = vec![byte; LEN];
                    let mut reader = data.as_slice();
                    let result = backend
                        .write(&CancellationToken::new(), "shared.bin", &mut reader, LEN as u64)
                        .await;
                    result
                }));
            }
            for task in tasks {
                task.await.unwrap().unwrap();
            }
            let contents = get(&backend, "shared.bin").await.unwrap();
            assert_eq!(contents.len(), LEN);
            assert!(contents.iter().all(|b| *b == contents[0]));
        }
    }

    #[tokio::test]
    async fn compaction_drops_idle_locks() {
        let dir = TempDir::new().unwrap();
        let backend = FilesystemBackend::new(dir.path());
        put(&backend, "one", b"1").await;
        put(&backend, "two", b"2").await;
        assert_eq!(backend.lock_count(), 2);

        assert_eq!(backend.compact_locks(), 2);
        assert_eq!(backend.lock_count(), 0);
        assert_eq!(get(&backend, "one").await.unwrap(), b"1");
    }
}
