//! Per-library vector indexes.
//!
//! Three interchangeable strategies behind one contract: exact flat scan,
//! random-hyperplane LSH, and an inverted file over spherical k-means
//! centroids. All strategies store L2-normalized vectors, score by cosine
//! similarity (dot product of normalized vectors, clamped to [-1, 1]), and
//! break score ties by ascending chunk id.

mod flat;
mod ivf;
mod lsh;
mod registry;

pub use flat::FlatIndex;
pub use ivf::IvfIndex;
pub use lsh::LshIndex;
pub use registry::{IndexHandle, IndexRegistry};

use crate::constants::INDEX_RNG_SEED;
use crate::error::{Error, Result};
use crate::model::IndexConfig;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use uuid::Uuid;

/// A single search result: chunk id plus cosine similarity in [-1, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredHit {
    pub chunk_id: Uuid,
    pub score: f32,
}

/// Candidate admission predicate, applied after candidate generation and
/// before final ranking selection.
pub type Filter<'a> = &'a dyn Fn(Uuid) -> bool;

/// The common index contract. One instance per library, parameterized by
/// the library's embedding dimension.
pub trait VectorIndex {
    /// Insert a vector. Fails on dimension mismatch or if the id is
    /// already present.
    fn add(&mut self, chunk_id: Uuid, vector: &[f32]) -> Result<()>;

    /// Replace the stored vector. Fails if absent or on dimension mismatch.
    fn update(&mut self, chunk_id: Uuid, vector: &[f32]) -> Result<()>;

    /// Idempotent removal; no-op if absent.
    fn remove(&mut self, chunk_id: Uuid);

    /// Up to `k` results, descending by cosine similarity, ties broken by
    /// ascending chunk id.
    fn search(&self, query: &[f32], k: usize, filter: Option<Filter<'_>>)
        -> Result<Vec<ScoredHit>>;

    /// Discard and reconstruct internal state from `(chunk_id, raw vector)`
    /// pairs.
    fn rebuild(&mut self, entries: Vec<(Uuid, Vec<f32>)>) -> Result<()>;

    fn size(&self) -> usize;

    fn dim(&self) -> usize;
}

/// Tagged variant over the three strategies; dispatch is by discriminant.
pub enum AnyIndex {
    Flat(FlatIndex),
    Lsh(LshIndex),
    Ivf(IvfIndex),
}

impl AnyIndex {
    /// Construct an empty index for a config, seeded with the process-wide
    /// constant so ANN results are reproducible across runs.
    pub fn from_config(config: &IndexConfig, dim: usize) -> Result<AnyIndex> {
        config.validate()?;
        Ok(match *config {
            IndexConfig::Flat => AnyIndex::Flat(FlatIndex::new(dim)),
            IndexConfig::Lsh {
                num_tables,
                hyperplanes_per_table,
            } => AnyIndex::Lsh(LshIndex::new(
                dim,
                num_tables,
                hyperplanes_per_table,
                INDEX_RNG_SEED,
            )),
            IndexConfig::Ivf {
                num_centroids,
                nprobe,
            } => AnyIndex::Ivf(IvfIndex::new(dim, num_centroids, nprobe, INDEX_RNG_SEED)),
        })
    }

    /// The config this instance was built from, used by the registry to
    /// detect configuration changes.
    pub fn config(&self) -> IndexConfig {
        match self {
            AnyIndex::Flat(_) => IndexConfig::Flat,
            AnyIndex::Lsh(idx) => IndexConfig::Lsh {
                num_tables: idx.num_tables(),
                hyperplanes_per_table: idx.hyperplanes_per_table(),
            },
            AnyIndex::Ivf(idx) => IndexConfig::Ivf {
                num_centroids: idx.num_centroids(),
                nprobe: idx.nprobe(),
            },
        }
    }
}

impl VectorIndex for AnyIndex {
    fn add(&mut self, chunk_id: Uuid, vector: &[f32]) -> Result<()> {
        match self {
            AnyIndex::Flat(idx) => idx.add(chunk_id, vector),
            AnyIndex::Lsh(idx) => idx.add(chunk_id, vector),
            AnyIndex::Ivf(idx) => idx.add(chunk_id, vector),
        }
    }

    fn update(&mut self, chunk_id: Uuid, vector: &[f32]) -> Result<()> {
        match self {
            AnyIndex::Flat(idx) => idx.update(chunk_id, vector),
            AnyIndex::Lsh(idx) => idx.update(chunk_id, vector),
            AnyIndex::Ivf(idx) => idx.update(chunk_id, vector),
        }
    }

    fn remove(&mut self, chunk_id: Uuid) {
        match self {
            AnyIndex::Flat(idx) => idx.remove(chunk_id),
            AnyIndex::Lsh(idx) => idx.remove(chunk_id),
            AnyIndex::Ivf(idx) => idx.remove(chunk_id),
        }
    }

    fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<Filter<'_>>,
    ) -> Result<Vec<ScoredHit>> {
        match self {
            AnyIndex::Flat(idx) => idx.search(query, k, filter),
            AnyIndex::Lsh(idx) => idx.search(query, k, filter),
            AnyIndex::Ivf(idx) => idx.search(query, k, filter),
        }
    }

    fn rebuild(&mut self, entries: Vec<(Uuid, Vec<f32>)>) -> Result<()> {
        match self {
            AnyIndex::Flat(idx) => idx.rebuild(entries),
            AnyIndex::Lsh(idx) => idx.rebuild(entries),
            AnyIndex::Ivf(idx) => idx.rebuild(entries),
        }
    }

    fn size(&self) -> usize {
        match self {
            AnyIndex::Flat(idx) => idx.size(),
            AnyIndex::Lsh(idx) => idx.size(),
            AnyIndex::Ivf(idx) => idx.size(),
        }
    }

    fn dim(&self) -> usize {
        match self {
            AnyIndex::Flat(idx) => idx.dim(),
            AnyIndex::Lsh(idx) => idx.dim(),
            AnyIndex::Ivf(idx) => idx.dim(),
        }
    }
}

// === Shared vector math ===

/// L2-normalize a vector. Zero and non-finite vectors are invalid input.
pub fn l2_normalize(vector: &[f32]) -> Result<Vec<f32>> {
    if vector.is_empty() {
        return Err(Error::validation("empty vector"));
    }
    if vector.iter().any(|x| !x.is_finite()) {
        return Err(Error::validation("vector contains non-finite values"));
    }
    let norm_sq: f32 = vector.iter().map(|x| x * x).sum();
    if norm_sq <= f32::EPSILON {
        return Err(Error::validation("zero vector cannot be indexed or queried"));
    }
    let inv_norm = 1.0 / norm_sq.sqrt();
    Ok(vector.iter().map(|x| x * inv_norm).collect())
}

/// Dot product of two equal-length vectors.
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Cosine of two normalized vectors, clamped to [-1, 1] against float
/// drift.
#[inline]
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    dot(a, b).clamp(-1.0, 1.0)
}

pub(crate) fn check_dim(expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(Error::validation(format!(
            "embedding dimension mismatch: expected {expected}, got {got}"
        )));
    }
    Ok(())
}

/// Best-first ordering: descending score, ties by ascending chunk id.
fn hit_cmp(a: &ScoredHit, b: &ScoredHit) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}

/// Heap entry ordered so that the greatest element is the worst hit, which
/// makes `BinaryHeap::peek`/`pop` evict the right candidate from a bounded
/// top-k heap.
struct WorstFirst(ScoredHit);

impl PartialEq for WorstFirst {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for WorstFirst {}

impl PartialOrd for WorstFirst {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WorstFirst {
    fn cmp(&self, other: &Self) -> Ordering {
        // `hit_cmp` is best-first (Less = better), so it already ranks the
        // worst hit greatest, which is what the max-heap must pop.
        hit_cmp(&self.0, &other.0)
    }
}

/// Exact re-rank shared by all strategies: score every admitted candidate
/// against the normalized query through a bounded min-heap of size `k` and
/// return the top `k`, best first.
pub(crate) fn rank_candidates<'a, I>(query_norm: &[f32], candidates: I, k: usize) -> Vec<ScoredHit>
where
    I: Iterator<Item = (Uuid, &'a [f32])>,
{
    if k == 0 {
        return Vec::new();
    }

    let mut heap: BinaryHeap<WorstFirst> = BinaryHeap::with_capacity(k + 1);
    for (chunk_id, vector) in candidates {
        let hit = ScoredHit {
            chunk_id,
            score: cosine(query_norm, vector),
        };
        if heap.len() < k {
            heap.push(WorstFirst(hit));
        } else if let Some(worst) = heap.peek() {
            if hit_cmp(&hit, &worst.0) == Ordering::Less {
                heap.pop();
                heap.push(WorstFirst(hit));
            }
        }
    }

    let mut hits: Vec<ScoredHit> = heap.into_iter().map(|w| w.0).collect();
    hits.sort_by(hit_cmp);
    hits
}
