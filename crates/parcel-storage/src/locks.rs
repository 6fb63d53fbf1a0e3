//! Per-path reader/writer locks.
//!
//! Each normalized key gets its own `RwLock`, created on first use. Readers of
//! a key share it, writers exclude everyone, and unrelated keys never contend.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

type PathLock = Arc<RwLock<()>>;

#[derive(Debug, Default)]
pub struct PathLocks {
    locks: DashMap<String, PathLock>,
}

/// Write guards over two keys, released together.
#[derive(Debug)]
pub struct PairGuard {
    _first: OwnedRwLockWriteGuard<()>,
    _second: Option<OwnedRwLockWriteGuard<()>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, key: &str) -> PathLock {
        if let Some(lock) = self.locks.get(key) {
            return Arc::clone(&lock);
        }
        // Cloned while the shard is held, so compaction sees the extra count.
        Arc::clone(&self.locks.entry(key.to_string()).or_default())
    }

    pub async fn read(&self, key: &str) -> OwnedRwLockReadGuard<()> {
        self.handle(key).read_owned().await
    }

    pub async fn write(&self, key: &str) -> OwnedRwLockWriteGuard<()> {
        self.handle(key).write_owned().await
    }

    /// Exclusive access to two keys.
    ///
    /// Locks are taken in lexical key order so two opposite moves cannot
    /// deadlock. Equal keys take a single lock.
    pub async fn write_pair(&self, a: &str, b: &str) -> PairGuard {
        if a == b {
            return PairGuard {
                _first: self.write(a).await,
                _second: None,
            };
        }
        let (low, high) = if a < b { (a, b) } else { (b, a) };
        let first = self.write(low).await;
        let second = self.write(high).await;
        PairGuard {
            _first: first,
            _second: Some(second),
        }
    }

    /// Number of keys currently holding a lock entry.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Drop lock entries nobody holds or waits on. Returns how many were removed.
    pub fn compact(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before.saturating_sub(self.locks.len())
    }
}
