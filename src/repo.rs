//! In-memory repositories for libraries, documents, and chunks.
//!
//! Repositories own the entity records and the secondary lookups
//! (`documents_by_library`, `chunks_by_library`, `chunks_by_document`).
//! Reads hand out deep copies so repo state cannot be mutated outside a
//! critical section. Each repository is guarded by a short internal
//! `RwLock` covering only its map operations; serialization of whole
//! use cases is the job of the per-library locks, not of these guards.
//!
//! `update_if_version` is the optimistic CAS primitive: commit only if the
//! stored version equals the expected one, bumping the version by exactly
//! one on success.

use crate::error::{Error, Result};
use crate::model::{Chunk, Document, Library, Metadata, Versioned};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use uuid::Uuid;

/// Generic CAS over a keyed entity map. Shared by all three repositories.
fn update_if_version<T, F>(
    map: &mut HashMap<Uuid, T>,
    kind: &str,
    id: Uuid,
    expected: u64,
    mutator: F,
) -> Result<T>
where
    T: Versioned + Clone,
    F: FnOnce(&mut T),
{
    let entity = map
        .get_mut(&id)
        .ok_or_else(|| Error::not_found(format!("{kind} {id}")))?;

    if entity.version() != expected {
        return Err(Error::conflict(format!(
            "{kind} {id}: expected version {expected}, found {}",
            entity.version()
        )));
    }

    mutator(entity);
    entity.bump();
    Ok(entity.clone())
}

// === Libraries ===

#[derive(Default)]
pub struct LibraryRepo {
    inner: RwLock<HashMap<Uuid, Library>>,
}

impl LibraryRepo {
    pub fn insert(&self, library: Library) -> Result<Library> {
        let mut map = self.inner.write().expect("library repo poisoned");
        if map.contains_key(&library.id) {
            return Err(Error::internal(format!(
                "library {} already exists",
                library.id
            )));
        }
        map.insert(library.id, library.clone());
        Ok(library)
    }

    pub fn get(&self, id: Uuid) -> Option<Library> {
        self.inner
            .read()
            .expect("library repo poisoned")
            .get(&id)
            .cloned()
    }

    pub fn list(&self) -> Vec<Library> {
        let mut all: Vec<Library> = self
            .inner
            .read()
            .expect("library repo poisoned")
            .values()
            .cloned()
            .collect();
        all.sort_by_key(|l| (l.created_at, l.id));
        all
    }

    pub fn remove(&self, id: Uuid) -> Option<Library> {
        self.inner
            .write()
            .expect("library repo poisoned")
            .remove(&id)
    }

    pub fn update_if_version<F>(&self, id: Uuid, expected: u64, mutator: F) -> Result<Library>
    where
        F: FnOnce(&mut Library),
    {
        let mut map = self.inner.write().expect("library repo poisoned");
        update_if_version(&mut map, "library", id, expected, mutator)
    }

    pub fn count(&self) -> usize {
        self.inner.read().expect("library repo poisoned").len()
    }
}

// === Documents ===

#[derive(Default)]
struct DocumentState {
    documents: HashMap<Uuid, Document>,
    by_library: HashMap<Uuid, HashSet<Uuid>>,
}

#[derive(Default)]
pub struct DocumentRepo {
    inner: RwLock<DocumentState>,
}

impl DocumentRepo {
    pub fn insert(&self, document: Document) -> Result<Document> {
        let mut state = self.inner.write().expect("document repo poisoned");
        if state.documents.contains_key(&document.id) {
            return Err(Error::internal(format!(
                "document {} already exists",
                document.id
            )));
        }
        state
            .by_library
            .entry(document.library_id)
            .or_default()
            .insert(document.id);
        state.documents.insert(document.id, document.clone());
        Ok(document)
    }

    pub fn get(&self, id: Uuid) -> Option<Document> {
        self.inner
            .read()
            .expect("document repo poisoned")
            .documents
            .get(&id)
            .cloned()
    }

    pub fn list_by_library(&self, library_id: Uuid) -> Vec<Document> {
        let state = self.inner.read().expect("document repo poisoned");
        let mut docs: Vec<Document> = state
            .by_library
            .get(&library_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.documents.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        docs.sort_by_key(|d| (d.created_at, d.id));
        docs
    }

    pub fn remove(&self, id: Uuid) -> Option<Document> {
        let mut state = self.inner.write().expect("document repo poisoned");
        let doc = state.documents.remove(&id)?;
        if let Some(ids) = state.by_library.get_mut(&doc.library_id) {
            ids.remove(&id);
            if ids.is_empty() {
                state.by_library.remove(&doc.library_id);
            }
        }
        Some(doc)
    }

    /// Remove every document of a library. Returns the removed ids.
    pub fn remove_by_library(&self, library_id: Uuid) -> Vec<Uuid> {
        let mut state = self.inner.write().expect("document repo poisoned");
        let ids: Vec<Uuid> = state
            .by_library
            .remove(&library_id)
            .map(|s| s.into_iter().collect())
            .unwrap_or_default();
        for id in &ids {
            state.documents.remove(id);
        }
        ids
    }

    pub fn update_if_version<F>(&self, id: Uuid, expected: u64, mutator: F) -> Result<Document>
    where
        F: FnOnce(&mut Document),
    {
        let mut state = self.inner.write().expect("document repo poisoned");
        update_if_version(&mut state.documents, "document", id, expected, mutator)
    }

    pub fn count_by_library(&self, library_id: Uuid) -> usize {
        self.inner
            .read()
            .expect("document repo poisoned")
            .by_library
            .get(&library_id)
            .map_or(0, |ids| ids.len())
    }
}

// === Chunks ===

#[derive(Default)]
struct ChunkState {
    chunks: HashMap<Uuid, Chunk>,
    by_library: HashMap<Uuid, HashSet<Uuid>>,
    by_document: HashMap<Uuid, HashSet<Uuid>>,
}

impl ChunkState {
    fn unlink(&mut self, chunk: &Chunk) {
        if let Some(ids) = self.by_library.get_mut(&chunk.library_id) {
            ids.remove(&chunk.id);
            if ids.is_empty() {
                self.by_library.remove(&chunk.library_id);
            }
        }
        if let Some(doc_id) = chunk.document_id {
            if let Some(ids) = self.by_document.get_mut(&doc_id) {
                ids.remove(&chunk.id);
                if ids.is_empty() {
                    self.by_document.remove(&doc_id);
                }
            }
        }
    }

    fn link(&mut self, chunk: &Chunk) {
        self.by_library
            .entry(chunk.library_id)
            .or_default()
            .insert(chunk.id);
        if let Some(doc_id) = chunk.document_id {
            self.by_document.entry(doc_id).or_default().insert(chunk.id);
        }
    }
}

#[derive(Default)]
pub struct ChunkRepo {
    inner: RwLock<ChunkState>,
}

impl ChunkRepo {
    pub fn insert(&self, chunk: Chunk) -> Result<Chunk> {
        let mut state = self.inner.write().expect("chunk repo poisoned");
        if state.chunks.contains_key(&chunk.id) {
            return Err(Error::internal(format!("chunk {} already exists", chunk.id)));
        }
        state.link(&chunk);
        state.chunks.insert(chunk.id, chunk.clone());
        Ok(chunk)
    }

    pub fn get(&self, id: Uuid) -> Option<Chunk> {
        self.inner
            .read()
            .expect("chunk repo poisoned")
            .chunks
            .get(&id)
            .cloned()
    }

    pub fn remove(&self, id: Uuid) -> Option<Chunk> {
        let mut state = self.inner.write().expect("chunk repo poisoned");
        let chunk = state.chunks.remove(&id)?;
        state.unlink(&chunk);
        Some(chunk)
    }

    /// Put a previously removed or mutated chunk back verbatim (rollback
    /// path; bypasses CAS on purpose).
    pub fn restore(&self, chunk: Chunk) {
        let mut state = self.inner.write().expect("chunk repo poisoned");
        if let Some(prev) = state.chunks.remove(&chunk.id) {
            state.unlink(&prev);
        }
        state.link(&chunk);
        state.chunks.insert(chunk.id, chunk);
    }

    /// Remove every chunk with the given `document_id`. Returns removed ids.
    pub fn remove_by_document(&self, document_id: Uuid) -> Vec<Uuid> {
        let mut state = self.inner.write().expect("chunk repo poisoned");
        let ids: Vec<Uuid> = state
            .by_document
            .remove(&document_id)
            .map(|s| s.into_iter().collect())
            .unwrap_or_default();
        for id in &ids {
            if let Some(chunk) = state.chunks.remove(id) {
                if let Some(lib_ids) = state.by_library.get_mut(&chunk.library_id) {
                    lib_ids.remove(id);
                    if lib_ids.is_empty() {
                        state.by_library.remove(&chunk.library_id);
                    }
                }
            }
        }
        ids
    }

    /// Remove every chunk of a library. Returns removed ids.
    pub fn remove_by_library(&self, library_id: Uuid) -> Vec<Uuid> {
        let mut state = self.inner.write().expect("chunk repo poisoned");
        let ids: Vec<Uuid> = state
            .by_library
            .remove(&library_id)
            .map(|s| s.into_iter().collect())
            .unwrap_or_default();
        for id in &ids {
            if let Some(chunk) = state.chunks.remove(id) {
                if let Some(doc_id) = chunk.document_id {
                    if let Some(doc_ids) = state.by_document.get_mut(&doc_id) {
                        doc_ids.remove(id);
                        if doc_ids.is_empty() {
                            state.by_document.remove(&doc_id);
                        }
                    }
                }
            }
        }
        ids
    }

    pub fn ids_by_library(&self, library_id: Uuid) -> Vec<Uuid> {
        self.inner
            .read()
            .expect("chunk repo poisoned")
            .by_library
            .get(&library_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn ids_by_document(&self, document_id: Uuid) -> Vec<Uuid> {
        self.inner
            .read()
            .expect("chunk repo poisoned")
            .by_document
            .get(&document_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn list_by_document(&self, document_id: Uuid) -> Vec<Chunk> {
        let state = self.inner.read().expect("chunk repo poisoned");
        let mut chunks: Vec<Chunk> = state
            .by_document
            .get(&document_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.chunks.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        chunks.sort_by_key(|c| (c.position, c.id));
        chunks
    }

    /// `(id, raw embedding)` pairs for a whole library, the input shape of
    /// an index rebuild.
    pub fn entries_for_library(&self, library_id: Uuid) -> Vec<(Uuid, Vec<f32>)> {
        let state = self.inner.read().expect("chunk repo poisoned");
        state
            .by_library
            .get(&library_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.chunks.get(id).map(|c| (c.id, c.embedding.clone())))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Evaluate a metadata equality predicate in place, without cloning the
    /// chunk. Used for candidate filtering during search.
    pub fn matches(&self, id: Uuid, document_id: Option<Uuid>, metadata: &Metadata) -> bool {
        let state = self.inner.read().expect("chunk repo poisoned");
        let Some(chunk) = state.chunks.get(&id) else {
            return false;
        };
        if let Some(doc_id) = document_id {
            if chunk.document_id != Some(doc_id) {
                return false;
            }
        }
        metadata
            .iter()
            .all(|(k, v)| chunk.metadata.get(k).is_some_and(|have| have == v))
    }

    pub fn update_if_version<F>(&self, id: Uuid, expected: u64, mutator: F) -> Result<Chunk>
    where
        F: FnOnce(&mut Chunk),
    {
        let mut state = self.inner.write().expect("chunk repo poisoned");
        // The mutator may retarget document_id; relink afterwards.
        let prev_doc = state.chunks.get(&id).and_then(|c| c.document_id);
        let updated = update_if_version(&mut state.chunks, "chunk", id, expected, mutator)?;
        if prev_doc != updated.document_id {
            if let Some(doc_id) = prev_doc {
                if let Some(ids) = state.by_document.get_mut(&doc_id) {
                    ids.remove(&id);
                    if ids.is_empty() {
                        state.by_document.remove(&doc_id);
                    }
                }
            }
            if let Some(doc_id) = updated.document_id {
                state.by_document.entry(doc_id).or_default().insert(id);
            }
        }
        Ok(updated)
    }

    pub fn count_by_library(&self, library_id: Uuid) -> usize {
        self.inner
            .read()
            .expect("chunk repo poisoned")
            .by_library
            .get(&library_id)
            .map_or(0, |ids| ids.len())
    }
}

/// The three repositories, grouped for shared access from the service and
/// the snapshot module.
#[derive(Default)]
pub struct Stores {
    pub libraries: LibraryRepo,
    pub documents: DocumentRepo,
    pub chunks: ChunkRepo,
}

impl Stores {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::IndexConfig;

    fn chunk(library_id: Uuid, document_id: Option<Uuid>) -> Chunk {
        Chunk::new(
            library_id,
            document_id,
            0,
            "text".into(),
            vec![1.0, 0.0],
            Metadata::new(),
        )
    }

    #[test]
    fn test_reads_are_deep_copies() {
        let repo = LibraryRepo::default();
        let lib = Library::new("a".into(), 2, IndexConfig::Flat, Metadata::new());
        let id = lib.id;
        repo.insert(lib).unwrap();

        let mut copy = repo.get(id).unwrap();
        copy.name = "mutated".into();

        assert_eq!(repo.get(id).unwrap().name, "a");
    }

    #[test]
    fn test_cas_stale_and_not_found() {
        let repo = ChunkRepo::default();
        let c = chunk(Uuid::new_v4(), None);
        let id = c.id;
        repo.insert(c).unwrap();

        let updated = repo
            .update_if_version(id, 1, |c| c.text = "new".into())
            .unwrap();
        assert_eq!(updated.version, 2);

        let stale = repo.update_if_version(id, 1, |c| c.text = "lost".into());
        assert!(matches!(stale, Err(Error::Conflict(_))));
        assert_eq!(repo.get(id).unwrap().text, "new");

        let missing = repo.update_if_version(Uuid::new_v4(), 1, |_| {});
        assert!(matches!(missing, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_secondary_maps_track_membership() {
        let repo = ChunkRepo::default();
        let lib = Uuid::new_v4();
        let doc = Uuid::new_v4();

        let a = chunk(lib, Some(doc));
        let b = chunk(lib, None);
        let (a_id, b_id) = (a.id, b.id);
        repo.insert(a).unwrap();
        repo.insert(b).unwrap();

        assert_eq!(repo.ids_by_library(lib).len(), 2);
        assert_eq!(repo.ids_by_document(doc), vec![a_id]);

        repo.remove(a_id);
        assert_eq!(repo.ids_by_library(lib), vec![b_id]);
        assert!(repo.ids_by_document(doc).is_empty());
    }

    #[test]
    fn test_remove_by_document_cascades() {
        let repo = ChunkRepo::default();
        let lib = Uuid::new_v4();
        let doc = Uuid::new_v4();

        for _ in 0..3 {
            repo.insert(chunk(lib, Some(doc))).unwrap();
        }
        let orphan = chunk(lib, None);
        let orphan_id = orphan.id;
        repo.insert(orphan).unwrap();

        let removed = repo.remove_by_document(doc);
        assert_eq!(removed.len(), 3);
        assert_eq!(repo.ids_by_library(lib), vec![orphan_id]);
    }

    #[test]
    fn test_cas_relinks_on_document_change() {
        let repo = ChunkRepo::default();
        let lib = Uuid::new_v4();
        let (doc_a, doc_b) = (Uuid::new_v4(), Uuid::new_v4());

        let c = chunk(lib, Some(doc_a));
        let id = c.id;
        repo.insert(c).unwrap();

        repo.update_if_version(id, 1, |c| c.document_id = Some(doc_b))
            .unwrap();

        assert!(repo.ids_by_document(doc_a).is_empty());
        assert_eq!(repo.ids_by_document(doc_b), vec![id]);
    }

    #[test]
    fn test_matches_predicate() {
        let repo = ChunkRepo::default();
        let lib = Uuid::new_v4();
        let mut c = chunk(lib, None);
        c.metadata.insert("lang".into(), "rust".into());
        let id = c.id;
        repo.insert(c).unwrap();

        let mut want = Metadata::new();
        want.insert("lang".into(), "rust".into());
        assert!(repo.matches(id, None, &want));

        want.insert("lang".into(), "go".into());
        assert!(!repo.matches(id, None, &want));

        assert!(!repo.matches(id, Some(Uuid::new_v4()), &Metadata::new()));
    }
}
