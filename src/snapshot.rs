//! Optional JSON snapshot of the entity stores.
//!
//! The snapshot holds libraries, documents, and chunks — never index
//! internals. On load the stores are repopulated verbatim and every
//! library's index is rebuilt from its chunks. Writes go through a
//! temporary file and an atomic rename so a crash mid-save leaves the
//! previous snapshot intact.

use crate::error::{Error, Result};
use crate::model::{Chunk, Document, Library};
use crate::repo::Stores;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub libraries: Vec<Library>,
    pub documents: Vec<Document>,
    pub chunks: Vec<Chunk>,
}

impl Snapshot {
    /// Capture the current store contents.
    pub fn capture(stores: &Stores) -> Self {
        let libraries = stores.libraries.list();
        let mut documents = Vec::new();
        let mut chunks = Vec::new();
        for library in &libraries {
            documents.extend(stores.documents.list_by_library(library.id));
            for id in stores.chunks.ids_by_library(library.id) {
                if let Some(chunk) = stores.chunks.get(id) {
                    chunks.push(chunk);
                }
            }
        }
        Self {
            libraries,
            documents,
            chunks,
        }
    }

    /// Replay a snapshot into empty stores.
    pub fn restore(self, stores: &Stores) -> Result<()> {
        for library in self.libraries {
            stores.libraries.insert(library)?;
        }
        for document in self.documents {
            stores.documents.insert(document)?;
        }
        for chunk in self.chunks {
            stores.chunks.insert(chunk)?;
        }
        Ok(())
    }
}

/// Write a snapshot of the stores to `path` (temp file + atomic rename).
pub fn save(stores: &Stores, path: &Path) -> Result<()> {
    let snapshot = Snapshot::capture(stores);
    let json = serde_json::to_vec_pretty(&snapshot)
        .map_err(|e| Error::internal(format!("snapshot serialization failed: {e}")))?;

    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json)
        .map_err(|e| Error::internal(format!("snapshot write failed: {e}")))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| Error::internal(format!("snapshot rename failed: {e}")))?;

    info!(
        path = %path.display(),
        libraries = snapshot.libraries.len(),
        chunks = snapshot.chunks.len(),
        "snapshot saved"
    );
    Ok(())
}

/// Load a snapshot into the stores if one exists at `path`. Returns whether
/// anything was loaded. Index rebuilds are the caller's next step.
pub fn load(stores: &Stores, path: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }

    let bytes = std::fs::read(path)
        .map_err(|e| Error::internal(format!("snapshot read failed: {e}")))?;
    let snapshot: Snapshot = serde_json::from_slice(&bytes)
        .map_err(|e| Error::internal(format!("snapshot parse failed: {e}")))?;

    let (libraries, chunks) = (snapshot.libraries.len(), snapshot.chunks.len());
    snapshot.restore(stores)?;

    info!(
        path = %path.display(),
        libraries,
        chunks,
        "snapshot loaded"
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{IndexConfig, Library, Metadata};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn seeded_stores() -> Arc<Stores> {
        let stores = Arc::new(Stores::new());
        let library = Library::new("snap".into(), 2, IndexConfig::Flat, Metadata::new());
        let library_id = library.id;
        stores.libraries.insert(library).unwrap();

        let document = Document::new(library_id, Metadata::new());
        let document_id = document.id;
        stores.documents.insert(document).unwrap();

        stores
            .chunks
            .insert(Chunk::new(
                library_id,
                Some(document_id),
                0,
                "hello".into(),
                vec![1.0, 0.0],
                Metadata::new(),
            ))
            .unwrap();
        stores
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        let stores = seeded_stores();

        save(&stores, &path).unwrap();

        let restored = Stores::new();
        assert!(load(&restored, &path).unwrap());

        let libraries = restored.libraries.list();
        assert_eq!(libraries.len(), 1);
        let library_id = libraries[0].id;
        assert_eq!(restored.documents.list_by_library(library_id).len(), 1);

        // Secondary maps are rebuilt from the replayed chunks.
        let ids = restored.chunks.ids_by_library(library_id);
        assert_eq!(ids.len(), 1);
        assert_eq!(restored.chunks.get(ids[0]).unwrap().text, "hello");
    }

    #[test]
    fn test_load_missing_file_is_a_noop() {
        let dir = tempdir().unwrap();
        let stores = Stores::new();
        assert!(!load(&stores, &dir.path().join("absent.json")).unwrap());
        assert_eq!(stores.libraries.count(), 0);
    }

    #[test]
    fn test_save_overwrites_atomically() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        let stores = seeded_stores();

        save(&stores, &path).unwrap();
        save(&stores, &path).unwrap();

        assert!(!path.with_extension("json.tmp").exists());
        let restored = Stores::new();
        assert!(load(&restored, &path).unwrap());
        assert_eq!(restored.libraries.count(), 1);
    }
}
