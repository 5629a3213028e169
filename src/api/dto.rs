//! Wire types for the HTTP adapter. Thin: entity types serialize as-is,
//! so DTOs exist only where the wire shape differs from the core types.

use crate::model::{Chunk, Document, IndexConfig, Metadata};
use crate::service::{ChunkInput, ChunkUpdate, ChunkUpsert, LibraryStats, SearchFilter, SearchHit};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn default_index_config() -> IndexConfig {
    IndexConfig::Flat
}

#[derive(Debug, Deserialize)]
pub struct CreateLibraryRequest {
    pub name: String,
    pub embedding_dim: usize,
    #[serde(default = "default_index_config")]
    pub index_config: IndexConfig,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Deserialize)]
pub struct UpdateConfigRequest {
    pub index_config: IndexConfig,
    pub expected_version: u64,
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateDocumentRequest {
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Deserialize)]
pub struct BulkUpsertRequest {
    pub chunks: Vec<ChunkUpsert>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateChunkRequest {
    #[serde(flatten)]
    pub fields: ChunkUpdate,
    pub expected_version: u64,
}

#[derive(Debug, Deserialize)]
pub struct CreateDocumentWithChunksRequest {
    #[serde(default)]
    pub metadata: Metadata,
    pub chunks: Vec<ChunkInput>,
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: Vec<f32>,
    /// Signed on the wire so a negative k maps to a validation error
    /// instead of a deserialization failure.
    pub k: i64,
    #[serde(default)]
    pub filter: SearchFilter,
}

#[derive(Debug, Serialize)]
pub struct DocumentWithChunksResponse {
    pub document: Document,
    pub chunks: Vec<Chunk>,
}

#[derive(Debug, Serialize)]
pub struct SearchHitResponse {
    pub chunk_id: Uuid,
    pub score: f32,
    pub chunk: Chunk,
}

impl From<SearchHit> for SearchHitResponse {
    fn from(hit: SearchHit) -> Self {
        Self {
            chunk_id: hit.chunk_id,
            score: hit.score,
            chunk: hit.chunk,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LibraryStatsResponse {
    pub library_id: Uuid,
    pub name: String,
    pub index_kind: &'static str,
    pub document_count: usize,
    pub chunk_count: usize,
    pub indexed_vectors: usize,
}

impl From<LibraryStats> for LibraryStatsResponse {
    fn from(stats: LibraryStats) -> Self {
        Self {
            library_id: stats.library_id,
            name: stats.name,
            index_kind: stats.index_kind,
            document_count: stats.document_count,
            chunk_count: stats.chunk_count,
            indexed_vectors: stats.indexed_vectors,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub libraries: usize,
}

#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub deleted: bool,
}
