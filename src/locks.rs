//! Per-library reader/writer lock registry.
//!
//! One `tokio::sync::RwLock` per library, created lazily on first use and
//! removed when the library is deleted. Guards are owned (`lock_owned`) so
//! they can cross await points and are released on every exit path,
//! including errors and cancellation. A cancelled acquisition leaves no
//! partial state; a timed-out acquisition surfaces as `busy`.
//!
//! The registry map itself is a `DashMap`: its shard locks cover only the
//! map lookup, never a whole use case.

use crate::constants::lock_timeout;
use crate::error::{Error, Result};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use uuid::Uuid;

pub type ReadGuard = OwnedRwLockReadGuard<()>;
pub type WriteGuard = OwnedRwLockWriteGuard<()>;

#[derive(Default)]
pub struct LockRegistry {
    locks: DashMap<Uuid, Arc<RwLock<()>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, library_id: Uuid) -> Arc<RwLock<()>> {
        self.locks
            .entry(library_id)
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Acquire the read lock for a library, or `busy` on timeout.
    pub async fn read(&self, library_id: Uuid) -> Result<ReadGuard> {
        let lock = self.entry(library_id);
        tokio::time::timeout(lock_timeout(), lock.read_owned())
            .await
            .map_err(|_| Error::Busy(format!("read lock timeout on library {library_id}")))
    }

    /// Acquire the write lock for a library, or `busy` on timeout.
    pub async fn write(&self, library_id: Uuid) -> Result<WriteGuard> {
        let lock = self.entry(library_id);
        tokio::time::timeout(lock_timeout(), lock.write_owned())
            .await
            .map_err(|_| Error::Busy(format!("write lock timeout on library {library_id}")))
    }

    /// Acquire write locks on several libraries in ascending id order, the
    /// deadlock-free order required of every multi-library operation.
    pub async fn write_many(&self, library_ids: &[Uuid]) -> Result<Vec<WriteGuard>> {
        let mut ids: Vec<Uuid> = library_ids.to_vec();
        ids.sort();
        ids.dedup();

        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            // Earlier guards drop if a later acquisition fails.
            guards.push(self.write(id).await?);
        }
        Ok(guards)
    }

    /// Drop the registry entry for a deleted library.
    ///
    /// Any guard already handed out keeps its `Arc` alive until release; a
    /// racer that acquires the stale lock afterwards will find the library
    /// gone and fail its existence precondition.
    pub fn remove(&self, library_id: Uuid) {
        self.locks.remove(&library_id);
    }

    #[cfg(test)]
    pub fn contains(&self, library_id: Uuid) -> bool {
        self.locks.contains_key(&library_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lazy_creation_and_removal() {
        let registry = LockRegistry::new();
        let id = Uuid::new_v4();
        assert!(!registry.contains(id));

        let guard = registry.read(id).await.unwrap();
        assert!(registry.contains(id));
        drop(guard);

        registry.remove(id);
        assert!(!registry.contains(id));
    }

    #[tokio::test]
    async fn test_write_lock_timeout_is_busy() {
        std::env::set_var("VECBASE_LOCK_TIMEOUT_MS", "50");
        let registry = LockRegistry::new();
        let id = Uuid::new_v4();

        let _held = registry.write(id).await.unwrap();
        let second = registry.write(id).await;
        std::env::remove_var("VECBASE_LOCK_TIMEOUT_MS");

        assert!(matches!(second, Err(Error::Busy(_))));
    }

    #[tokio::test]
    async fn test_readers_share_writers_exclude() {
        let registry = LockRegistry::new();
        let id = Uuid::new_v4();

        let r1 = registry.read(id).await.unwrap();
        let r2 = registry.read(id).await.unwrap();
        drop(r1);
        drop(r2);

        let w = registry.write(id).await.unwrap();
        drop(w);
        let _r3 = registry.read(id).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_many_sorts_and_dedups() {
        let registry = LockRegistry::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let guards = registry.write_many(&[b, a, b]).await.unwrap();
        assert_eq!(guards.len(), 2);
    }
}
