//! Service layer: the transactional choreography over repos, locks, and
//! indexes.
//!
//! Every mutating use case on a library follows the same order: acquire the
//! library's write lock, validate preconditions, apply repository writes,
//! apply the matching index updates, CAS-commit the owning entity, release.
//! An index failure reverts the repository write before the lock is
//! released; batch operations keep an undo log and roll back in reverse.
//!
//! Reads take the read lock, snapshot what they need, release, and finalize
//! outside the critical section on deep-copied state.

use crate::constants::MAX_CAS_RETRIES;
use crate::error::{Error, Result};
use crate::index::{Filter, IndexHandle, IndexRegistry, ScoredHit, VectorIndex};
use crate::locks::LockRegistry;
use crate::model::{Chunk, Document, IndexConfig, Library, Metadata};
use crate::repo::Stores;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Input for a single chunk creation (standalone, bulk, or alongside a
/// document).
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkInput {
    #[serde(default)]
    pub document_id: Option<Uuid>,
    #[serde(default)]
    pub position: u32,
    pub text: String,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// One item of a bulk upsert: with `id` set and present, the chunk is
/// updated in place; otherwise it is created.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkUpsert {
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(flatten)]
    pub input: ChunkInput,
}

/// Partial update of a chunk; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChunkUpdate {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub position: Option<u32>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub metadata: Option<Metadata>,
}

/// Post-candidate filter for search: restrict to a document and/or to
/// chunks whose metadata contains every given key/value pair.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchFilter {
    #[serde(default)]
    pub document_id: Option<Uuid>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl SearchFilter {
    fn is_empty(&self) -> bool {
        self.document_id.is_none() && self.metadata.is_empty()
    }
}

/// A search result hydrated with a deep copy of its chunk.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub chunk_id: Uuid,
    pub score: f32,
    pub chunk: Chunk,
}

/// Aggregate counters for one library.
#[derive(Debug, Clone)]
pub struct LibraryStats {
    pub library_id: Uuid,
    pub name: String,
    pub index_kind: &'static str,
    pub document_count: usize,
    pub chunk_count: usize,
    pub indexed_vectors: usize,
}

/// Rollback journal for batch mutations: applied steps are reverted in
/// reverse order if a later step fails, so a failed batch persists nothing.
enum Applied {
    ChunkCreated(Uuid),
    ChunkUpdated(Box<Chunk>),
    DocumentCreated(Uuid),
}

pub struct VectorService {
    stores: Arc<Stores>,
    locks: LockRegistry,
    indexes: IndexRegistry,
}

impl VectorService {
    pub fn new() -> Self {
        Self::with_stores(Arc::new(Stores::new()))
    }

    pub fn with_stores(stores: Arc<Stores>) -> Self {
        Self {
            stores,
            locks: LockRegistry::new(),
            indexes: IndexRegistry::new(),
        }
    }

    pub fn stores(&self) -> Arc<Stores> {
        self.stores.clone()
    }

    /// Rebuild every library's index from the chunk repository, one write
    /// lock at a time. Called at process start, after a snapshot load.
    pub async fn rebuild_all_indexes(&self) -> Result<()> {
        for library in self.stores.libraries.list() {
            let _guard = self.locks.write(library.id).await?;
            let entries = self.stores.chunks.entries_for_library(library.id);
            let count = entries.len();
            self.indexes.swap(
                library.id,
                &library.index_config,
                library.embedding_dim,
                entries,
            )?;
            info!(
                library = %library.id,
                kind = library.index_config.kind(),
                vectors = count,
                "index rebuilt at startup"
            );
        }
        Ok(())
    }

    // === Libraries ===

    pub async fn create_library(
        &self,
        name: String,
        embedding_dim: usize,
        index_config: IndexConfig,
        metadata: Metadata,
    ) -> Result<Library> {
        if embedding_dim == 0 {
            return Err(Error::validation("embedding_dim must be positive"));
        }
        index_config.validate()?;

        let library = Library::new(name, embedding_dim, index_config, metadata);

        // Lock, empty index, and repo record are established atomically
        // from any other task's point of view.
        let library_id = library.id;
        let _guard = self.locks.write(library_id).await?;
        self.indexes
            .ensure(library_id, &library.index_config, embedding_dim, Vec::new)?;
        let library = self.stores.libraries.insert(library).inspect_err(|_| {
            self.indexes.drop_index(library_id);
        })?;

        info!(library = %library.id, dim = embedding_dim, kind = library.index_config.kind(), "library created");
        Ok(library)
    }

    pub async fn get_library(&self, library_id: Uuid) -> Result<Library> {
        let _guard = self.locks.read(library_id).await?;
        self.stores
            .libraries
            .get(library_id)
            .ok_or_else(|| Error::not_found(format!("library {library_id}")))
    }

    pub fn list_libraries(&self) -> Vec<Library> {
        self.stores.libraries.list()
    }

    /// Switch a library to a new index config: the replacement index is
    /// built and rebuilt from the chunk repo under the write lock, then the
    /// library record is CAS-committed.
    pub async fn update_library_config(
        &self,
        library_id: Uuid,
        new_config: IndexConfig,
        expected_version: u64,
    ) -> Result<Library> {
        new_config.validate()?;

        let _guard = self.locks.write(library_id).await?;
        let library = self
            .stores
            .libraries
            .get(library_id)
            .ok_or_else(|| Error::not_found(format!("library {library_id}")))?;

        // Stale callers fail before the expensive rebuild.
        if library.version != expected_version {
            return Err(Error::conflict(format!(
                "library {library_id}: expected version {expected_version}, found {}",
                library.version
            )));
        }

        let prior_config = library.index_config.clone();
        let entries = self.stores.chunks.entries_for_library(library_id);
        self.indexes
            .swap(library_id, &new_config, library.embedding_dim, entries)?;

        let committed = self.stores.libraries.update_if_version(
            library_id,
            expected_version,
            |l| l.index_config = new_config.clone(),
        );

        match committed {
            Ok(library) => {
                info!(library = %library_id, kind = library.index_config.kind(), "index config updated");
                Ok(library)
            }
            Err(e) => {
                // Serialized by the write lock, so this only fires on an
                // invariant violation; restore the prior index regardless.
                let entries = self.stores.chunks.entries_for_library(library_id);
                if let Err(revert) =
                    self.indexes
                        .swap(library_id, &prior_config, library.embedding_dim, entries)
                {
                    error!(library = %library_id, %revert, "failed to revert index swap");
                }
                Err(e)
            }
        }
    }

    /// Delete a library and cascade to its documents, chunks, index, and
    /// lock in the same critical section.
    pub async fn delete_library(&self, library_id: Uuid) -> Result<()> {
        let guard = self.locks.write(library_id).await?;
        if self.stores.libraries.get(library_id).is_none() {
            return Err(Error::not_found(format!("library {library_id}")));
        }

        let chunks = self.stores.chunks.remove_by_library(library_id);
        let documents = self.stores.documents.remove_by_library(library_id);
        self.stores.libraries.remove(library_id);
        self.indexes.drop_index(library_id);

        drop(guard);
        self.locks.remove(library_id);

        info!(
            library = %library_id,
            documents = documents.len(),
            chunks = chunks.len(),
            "library deleted"
        );
        Ok(())
    }

    pub async fn library_stats(&self, library_id: Uuid) -> Result<LibraryStats> {
        let _guard = self.locks.read(library_id).await?;
        let library = self
            .stores
            .libraries
            .get(library_id)
            .ok_or_else(|| Error::not_found(format!("library {library_id}")))?;
        let handle = self.indexes.get(library_id)?;
        let indexed_vectors = handle.read().expect("index lock poisoned").size();

        Ok(LibraryStats {
            library_id,
            name: library.name,
            index_kind: library.index_config.kind(),
            document_count: self.stores.documents.count_by_library(library_id),
            chunk_count: self.stores.chunks.count_by_library(library_id),
            indexed_vectors,
        })
    }

    // === Documents ===

    pub async fn create_document(&self, library_id: Uuid, metadata: Metadata) -> Result<Document> {
        let _guard = self.locks.write(library_id).await?;
        self.require_library(library_id)?;
        let document = self.stores.documents.insert(Document::new(library_id, metadata))?;
        debug!(library = %library_id, document = %document.id, "document created");
        Ok(document)
    }

    pub async fn get_document(&self, document_id: Uuid) -> Result<Document> {
        let document = self
            .stores
            .documents
            .get(document_id)
            .ok_or_else(|| Error::not_found(format!("document {document_id}")))?;
        let _guard = self.locks.read(document.library_id).await?;
        self.stores
            .documents
            .get(document_id)
            .ok_or_else(|| Error::not_found(format!("document {document_id}")))
    }

    pub async fn list_documents(&self, library_id: Uuid) -> Result<Vec<Document>> {
        let _guard = self.locks.read(library_id).await?;
        self.require_library(library_id)?;
        Ok(self.stores.documents.list_by_library(library_id))
    }

    /// Delete a document and every chunk bound to it in one critical
    /// section.
    pub async fn delete_document(&self, document_id: Uuid) -> Result<()> {
        let document = self
            .stores
            .documents
            .get(document_id)
            .ok_or_else(|| Error::not_found(format!("document {document_id}")))?;

        let _guard = self.locks.write(document.library_id).await?;
        // Re-check under the lock; a racer may have deleted it first.
        if self.stores.documents.get(document_id).is_none() {
            return Err(Error::not_found(format!("document {document_id}")));
        }

        let removed = self.stores.chunks.remove_by_document(document_id);
        let handle = self.indexes.get(document.library_id)?;
        {
            let mut index = handle.write().expect("index lock poisoned");
            for chunk_id in &removed {
                index.remove(*chunk_id);
            }
        }
        self.stores.documents.remove(document_id);

        debug!(document = %document_id, chunks = removed.len(), "document deleted");
        Ok(())
    }

    // === Chunks ===

    pub async fn create_chunk(&self, library_id: Uuid, input: ChunkInput) -> Result<Chunk> {
        let _guard = self.locks.write(library_id).await?;
        let library = self.require_library(library_id)?;
        self.validate_chunk_input(&library, &input)?;

        let chunk = Chunk::new(
            library_id,
            input.document_id,
            input.position,
            input.text,
            input.embedding,
            input.metadata,
        );
        let chunk = self.stores.chunks.insert(chunk)?;

        let handle = self.indexes.get(library_id)?;
        let indexed = handle
            .write()
            .expect("index lock poisoned")
            .add(chunk.id, &chunk.embedding);
        if let Err(e) = indexed {
            // Revert the repo write before releasing the lock.
            self.stores.chunks.remove(chunk.id);
            return Err(e);
        }

        debug!(library = %library_id, chunk = %chunk.id, "chunk created");
        Ok(chunk)
    }

    /// Per-batch transactional upsert: every input is validated before any
    /// write, applied writes are journaled, and a failure rolls the batch
    /// back in reverse order. Each chunk gets exactly one version bump.
    pub async fn bulk_upsert_chunks(
        &self,
        library_id: Uuid,
        items: Vec<ChunkUpsert>,
    ) -> Result<Vec<Chunk>> {
        let _guard = self.locks.write(library_id).await?;
        let library = self.require_library(library_id)?;

        for item in &items {
            self.validate_chunk_input(&library, &item.input)?;
            if let Some(id) = item.id {
                if let Some(existing) = self.stores.chunks.get(id) {
                    if existing.library_id != library_id {
                        return Err(Error::validation(format!(
                            "chunk {id} belongs to library {}",
                            existing.library_id
                        )));
                    }
                }
            }
        }

        let handle = self.indexes.get(library_id)?;
        let mut journal: Vec<Applied> = Vec::with_capacity(items.len());
        let mut out: Vec<Chunk> = Vec::with_capacity(items.len());

        for item in items {
            let result = self.apply_upsert(library_id, &handle, item, &mut journal);
            match result {
                Ok(chunk) => out.push(chunk),
                Err(e) => {
                    error!(library = %library_id, %e, "bulk upsert failed, rolling back batch");
                    self.rollback(&handle, journal);
                    return Err(e);
                }
            }
        }

        debug!(library = %library_id, chunks = out.len(), "bulk upsert committed");
        Ok(out)
    }

    /// Create a document and its chunks in one critical section.
    pub async fn create_document_with_chunks(
        &self,
        library_id: Uuid,
        document_metadata: Metadata,
        chunks: Vec<ChunkInput>,
    ) -> Result<(Document, Vec<Chunk>)> {
        let _guard = self.locks.write(library_id).await?;
        let library = self.require_library(library_id)?;
        for input in &chunks {
            // document_id is implied by the new document; reject strays.
            if input.document_id.is_some() {
                return Err(Error::validation(
                    "chunks of a new document may not carry a document_id",
                ));
            }
            self.validate_embedding(&library, &input.embedding)?;
        }

        let document = self
            .stores
            .documents
            .insert(Document::new(library_id, document_metadata))?;

        let handle = self.indexes.get(library_id)?;
        let mut journal: Vec<Applied> = vec![Applied::DocumentCreated(document.id)];
        let mut out: Vec<Chunk> = Vec::with_capacity(chunks.len());

        for input in chunks {
            let upsert = ChunkUpsert {
                id: None,
                input: ChunkInput {
                    document_id: Some(document.id),
                    ..input
                },
            };
            match self.apply_upsert(library_id, &handle, upsert, &mut journal) {
                Ok(chunk) => out.push(chunk),
                Err(e) => {
                    error!(library = %library_id, %e, "document-with-chunks failed, rolling back");
                    self.rollback(&handle, journal);
                    return Err(e);
                }
            }
        }

        debug!(library = %library_id, document = %document.id, chunks = out.len(), "document with chunks created");
        Ok((document, out))
    }

    pub async fn get_chunk(&self, chunk_id: Uuid) -> Result<Chunk> {
        let chunk = self
            .stores
            .chunks
            .get(chunk_id)
            .ok_or_else(|| Error::not_found(format!("chunk {chunk_id}")))?;
        let _guard = self.locks.read(chunk.library_id).await?;
        self.stores
            .chunks
            .get(chunk_id)
            .ok_or_else(|| Error::not_found(format!("chunk {chunk_id}")))
    }

    pub async fn list_document_chunks(&self, document_id: Uuid) -> Result<Vec<Chunk>> {
        let document = self
            .stores
            .documents
            .get(document_id)
            .ok_or_else(|| Error::not_found(format!("document {document_id}")))?;
        let _guard = self.locks.read(document.library_id).await?;
        Ok(self.stores.chunks.list_by_document(document_id))
    }

    /// Update chunk fields with client-supplied optimistic versioning. A
    /// version mismatch surfaces as conflict; the caller re-reads and
    /// retries with the fresh version.
    pub async fn update_chunk(
        &self,
        chunk_id: Uuid,
        update: ChunkUpdate,
        expected_version: u64,
    ) -> Result<Chunk> {
        let located = self
            .stores
            .chunks
            .get(chunk_id)
            .ok_or_else(|| Error::not_found(format!("chunk {chunk_id}")))?;

        let _guard = self.locks.write(located.library_id).await?;
        let library = self.require_library(located.library_id)?;
        let prev = self
            .stores
            .chunks
            .get(chunk_id)
            .ok_or_else(|| Error::not_found(format!("chunk {chunk_id}")))?;

        if prev.version != expected_version {
            return Err(Error::conflict(format!(
                "chunk {chunk_id}: expected version {expected_version}, found {}",
                prev.version
            )));
        }
        if let Some(embedding) = &update.embedding {
            self.validate_embedding(&library, embedding)?;
        }

        let embedding_changed = update.embedding.is_some();
        let committed = self
            .stores
            .chunks
            .update_if_version(chunk_id, expected_version, |c| {
                if let Some(text) = update.text.clone() {
                    c.text = text;
                }
                if let Some(position) = update.position {
                    c.position = position;
                }
                if let Some(embedding) = update.embedding.clone() {
                    c.embedding = embedding;
                }
                if let Some(metadata) = update.metadata.clone() {
                    c.metadata = metadata;
                }
            })?;

        if embedding_changed {
            let handle = self.indexes.get(located.library_id)?;
            let reindexed = handle
                .write()
                .expect("index lock poisoned")
                .update(chunk_id, &committed.embedding);
            if let Err(e) = reindexed {
                self.stores.chunks.restore(prev);
                return Err(e);
            }
        }

        debug!(chunk = %chunk_id, version = committed.version, "chunk updated");
        Ok(committed)
    }

    pub async fn delete_chunk(&self, chunk_id: Uuid) -> Result<()> {
        let located = self
            .stores
            .chunks
            .get(chunk_id)
            .ok_or_else(|| Error::not_found(format!("chunk {chunk_id}")))?;

        let _guard = self.locks.write(located.library_id).await?;
        if self.stores.chunks.remove(chunk_id).is_none() {
            return Err(Error::not_found(format!("chunk {chunk_id}")));
        }
        let handle = self.indexes.get(located.library_id)?;
        handle.write().expect("index lock poisoned").remove(chunk_id);

        debug!(chunk = %chunk_id, "chunk deleted");
        Ok(())
    }

    // === Search ===

    /// Top-k cosine search. Candidate generation and ranking happen under
    /// the read lock; hydration happens outside it on deep copies.
    pub async fn search(
        &self,
        library_id: Uuid,
        query: Vec<f32>,
        k: usize,
        filter: SearchFilter,
    ) -> Result<Vec<SearchHit>> {
        if query.is_empty() {
            return Err(Error::validation("query vector is empty"));
        }

        let hits: Vec<ScoredHit> = {
            let _guard = self.locks.read(library_id).await?;
            let library = self.require_library(library_id)?;
            if query.len() != library.embedding_dim {
                return Err(Error::validation(format!(
                    "query dimension mismatch: expected {}, got {}",
                    library.embedding_dim,
                    query.len()
                )));
            }
            if let Some(document_id) = filter.document_id {
                let document = self
                    .stores
                    .documents
                    .get(document_id)
                    .ok_or_else(|| Error::not_found(format!("document {document_id}")))?;
                if document.library_id != library_id {
                    return Err(Error::validation(format!(
                        "document {document_id} belongs to library {}",
                        document.library_id
                    )));
                }
            }

            let handle = self.indexes.get(library_id)?;
            let chunks = &self.stores.chunks;
            let predicate =
                |id: Uuid| chunks.matches(id, filter.document_id, &filter.metadata);
            let filter_ref: Option<Filter<'_>> = if filter.is_empty() {
                None
            } else {
                Some(&predicate)
            };

            let result = handle
                .read()
                .expect("index lock poisoned")
                .search(&query, k, filter_ref)?;
            result
        };

        // Hydrate outside the critical section; a chunk deleted since the
        // snapshot is simply dropped from the result.
        Ok(hits
            .into_iter()
            .filter_map(|hit| {
                self.stores.chunks.get(hit.chunk_id).map(|chunk| SearchHit {
                    chunk_id: hit.chunk_id,
                    score: hit.score,
                    chunk,
                })
            })
            .collect())
    }

    // === Internals ===

    fn require_library(&self, library_id: Uuid) -> Result<Library> {
        self.stores
            .libraries
            .get(library_id)
            .ok_or_else(|| Error::not_found(format!("library {library_id}")))
    }

    fn validate_embedding(&self, library: &Library, embedding: &[f32]) -> Result<()> {
        if embedding.len() != library.embedding_dim {
            return Err(Error::validation(format!(
                "embedding dimension mismatch: expected {}, got {}",
                library.embedding_dim,
                embedding.len()
            )));
        }
        // Surfaces zero/non-finite vectors before any repo write, so the
        // later index mutation cannot fail on input validity.
        crate::index::l2_normalize(embedding).map(|_| ())
    }

    fn validate_chunk_input(&self, library: &Library, input: &ChunkInput) -> Result<()> {
        self.validate_embedding(library, &input.embedding)?;
        if let Some(document_id) = input.document_id {
            let document = self
                .stores
                .documents
                .get(document_id)
                .ok_or_else(|| Error::not_found(format!("document {document_id}")))?;
            if document.library_id != library.id {
                return Err(Error::validation(format!(
                    "document {document_id} belongs to library {}",
                    document.library_id
                )));
            }
        }
        Ok(())
    }

    /// Apply one upsert under an already-held write lock, journaling the
    /// applied step for rollback.
    fn apply_upsert(
        &self,
        library_id: Uuid,
        handle: &IndexHandle,
        item: ChunkUpsert,
        journal: &mut Vec<Applied>,
    ) -> Result<Chunk> {
        let existing = item.id.and_then(|id| self.stores.chunks.get(id));

        match existing {
            Some(prev) => {
                let input = item.input;
                let committed = self.cas_chunk_with_retry(prev.id, move |c| {
                    c.document_id = input.document_id;
                    c.position = input.position;
                    c.text = input.text.clone();
                    c.embedding = input.embedding.clone();
                    c.metadata = input.metadata.clone();
                })?;
                handle
                    .write()
                    .expect("index lock poisoned")
                    .update(committed.id, &committed.embedding)?;
                journal.push(Applied::ChunkUpdated(Box::new(prev)));
                Ok(committed)
            }
            None => {
                let mut chunk = Chunk::new(
                    library_id,
                    item.input.document_id,
                    item.input.position,
                    item.input.text,
                    item.input.embedding,
                    item.input.metadata,
                );
                if let Some(id) = item.id {
                    chunk.id = id;
                }
                let chunk = self.stores.chunks.insert(chunk)?;
                handle
                    .write()
                    .expect("index lock poisoned")
                    .add(chunk.id, &chunk.embedding)
                    .inspect_err(|_| {
                        self.stores.chunks.remove(chunk.id);
                    })?;
                journal.push(Applied::ChunkCreated(chunk.id));
                Ok(chunk)
            }
        }
    }

    /// Service-internal CAS commit: the expected version is re-read on each
    /// attempt, bounded by `MAX_CAS_RETRIES`. Under the library write lock
    /// the first attempt wins; the loop exists for the contract, not the
    /// common path.
    fn cas_chunk_with_retry<F>(&self, chunk_id: Uuid, mutator: F) -> Result<Chunk>
    where
        F: Fn(&mut Chunk),
    {
        let mut last = Error::conflict(format!("chunk {chunk_id}: retries exhausted"));
        for _ in 0..MAX_CAS_RETRIES {
            let current = self
                .stores
                .chunks
                .get(chunk_id)
                .ok_or_else(|| Error::not_found(format!("chunk {chunk_id}")))?;
            match self
                .stores
                .chunks
                .update_if_version(chunk_id, current.version, &mutator)
            {
                Ok(chunk) => return Ok(chunk),
                Err(e @ Error::Conflict(_)) => last = e,
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    /// Revert journaled steps in reverse order. Failures here are invariant
    /// violations and are logged rather than propagated — the original
    /// error is what the caller needs to see.
    fn rollback(&self, handle: &IndexHandle, journal: Vec<Applied>) {
        let mut index = handle.write().expect("index lock poisoned");
        for step in journal.into_iter().rev() {
            match step {
                Applied::ChunkCreated(id) => {
                    self.stores.chunks.remove(id);
                    index.remove(id);
                }
                Applied::ChunkUpdated(prev) => {
                    if let Err(e) = index.update(prev.id, &prev.embedding) {
                        error!(chunk = %prev.id, %e, "rollback failed to restore index vector");
                    }
                    self.stores.chunks.restore(*prev);
                }
                Applied::DocumentCreated(id) => {
                    self.stores.documents.remove(id);
                }
            }
        }
    }
}

impl Default for VectorService {
    fn default() -> Self {
        Self::new()
    }
}
