//! Library id → index instance registry.
//!
//! Owns one `AnyIndex` per library behind a `DashMap`; the shard locks
//! cover only map lookups. Mutating an index requires the library's write
//! lock, which the service layer holds around every call that reaches a
//! `&mut` index — the inner `RwLock` only protects the handle against
//! readers that are snapshotting concurrently.

use crate::error::{Error, Result};
use crate::index::{AnyIndex, VectorIndex};
use crate::model::IndexConfig;
use dashmap::DashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;
use uuid::Uuid;

pub type IndexHandle = Arc<RwLock<AnyIndex>>;

#[derive(Default)]
pub struct IndexRegistry {
    indexes: DashMap<Uuid, IndexHandle>,
}

impl IndexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent: create an empty index matching `config` if none exists.
    /// If one exists with a different config, rebuild from the supplied
    /// entries instead. Callers must hold the library's write lock.
    pub fn ensure<F>(
        &self,
        library_id: Uuid,
        config: &IndexConfig,
        dim: usize,
        entries: F,
    ) -> Result<()>
    where
        F: FnOnce() -> Vec<(Uuid, Vec<f32>)>,
    {
        if let Some(handle) = self.indexes.get(&library_id) {
            let current = handle.read().expect("index lock poisoned").config();
            if current == *config {
                return Ok(());
            }
            drop(handle);
            return self.swap(library_id, config, dim, entries());
        }

        let index = AnyIndex::from_config(config, dim)?;
        self.indexes
            .insert(library_id, Arc::new(RwLock::new(index)));
        debug!(library = %library_id, kind = config.kind(), "index created");
        Ok(())
    }

    /// The current index handle, or `internal` if the library has none —
    /// every existing library is supposed to have one.
    pub fn get(&self, library_id: Uuid) -> Result<IndexHandle> {
        self.indexes
            .get(&library_id)
            .map(|h| h.clone())
            .ok_or_else(|| Error::internal(format!("no index registered for library {library_id}")))
    }

    /// Construct a new index for `config`, rebuild it from `entries`, then
    /// atomically replace the old one. All-or-nothing: a rebuild failure
    /// leaves the prior index in place. Callers must hold the library's
    /// write lock.
    pub fn swap(
        &self,
        library_id: Uuid,
        config: &IndexConfig,
        dim: usize,
        entries: Vec<(Uuid, Vec<f32>)>,
    ) -> Result<()> {
        let mut replacement = AnyIndex::from_config(config, dim)?;
        replacement.rebuild(entries)?;

        self.indexes
            .insert(library_id, Arc::new(RwLock::new(replacement)));
        debug!(library = %library_id, kind = config.kind(), "index swapped");
        Ok(())
    }

    /// Release the index of a deleted library.
    pub fn drop_index(&self, library_id: Uuid) {
        self.indexes.remove(&library_id);
    }

    pub fn contains(&self, library_id: Uuid) -> bool {
        self.indexes.contains_key(&library_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_is_idempotent() {
        let registry = IndexRegistry::new();
        let id = Uuid::new_v4();

        registry
            .ensure(id, &IndexConfig::Flat, 3, Vec::new)
            .unwrap();
        let handle = registry.get(id).unwrap();
        handle
            .write()
            .unwrap()
            .add(Uuid::new_v4(), &[1.0, 0.0, 0.0])
            .unwrap();

        // Same config: the populated index survives.
        registry
            .ensure(id, &IndexConfig::Flat, 3, Vec::new)
            .unwrap();
        assert_eq!(registry.get(id).unwrap().read().unwrap().size(), 1);
    }

    #[test]
    fn test_ensure_rebuilds_on_config_change() {
        let registry = IndexRegistry::new();
        let id = Uuid::new_v4();
        let chunk = Uuid::new_v4();

        registry
            .ensure(id, &IndexConfig::Flat, 3, Vec::new)
            .unwrap();

        let lsh = IndexConfig::Lsh {
            num_tables: 2,
            hyperplanes_per_table: 4,
        };
        registry
            .ensure(id, &lsh, 3, || vec![(chunk, vec![1.0, 0.0, 0.0])])
            .unwrap();

        let handle = registry.get(id).unwrap();
        let index = handle.read().unwrap();
        assert_eq!(index.config(), lsh);
        assert_eq!(index.size(), 1);
    }

    #[test]
    fn test_swap_failure_keeps_prior_index() {
        let registry = IndexRegistry::new();
        let id = Uuid::new_v4();

        registry
            .ensure(id, &IndexConfig::Flat, 3, Vec::new)
            .unwrap();
        registry
            .get(id)
            .unwrap()
            .write()
            .unwrap()
            .add(Uuid::new_v4(), &[1.0, 0.0, 0.0])
            .unwrap();

        // Wrong-dimension entry poisons the rebuild; the old index stays.
        let bad = registry.swap(
            id,
            &IndexConfig::Flat,
            3,
            vec![(Uuid::new_v4(), vec![1.0, 0.0])],
        );
        assert!(bad.is_err());
        assert_eq!(registry.get(id).unwrap().read().unwrap().size(), 1);
    }

    #[test]
    fn test_drop_releases() {
        let registry = IndexRegistry::new();
        let id = Uuid::new_v4();
        registry
            .ensure(id, &IndexConfig::Flat, 3, Vec::new)
            .unwrap();

        registry.drop_index(id);
        assert!(!registry.contains(id));
        assert!(registry.get(id).is_err());
    }
}
