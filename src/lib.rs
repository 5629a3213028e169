//! vecbase: an in-process vector database.
//!
//! Libraries hold documents and chunks; every chunk carries a pre-computed
//! embedding. Each library owns one pluggable ANN index (flat exact, LSH,
//! or IVF) and one reader/writer lock; mutations run under the write lock
//! with optimistic version+CAS commits, searches run under the read lock
//! and hydrate their hits from deep-copied repository state.

pub mod api;
pub mod constants;
pub mod error;
pub mod index;
pub mod locks;
pub mod model;
pub mod repo;
pub mod service;
pub mod snapshot;

pub use error::{Error, Result};
pub use model::{Chunk, Document, IndexConfig, Library, Metadata};
pub use service::{
    ChunkInput, ChunkUpdate, ChunkUpsert, SearchFilter, SearchHit, VectorService,
};
