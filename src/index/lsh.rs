//! Random-hyperplane LSH index.
//!
//! Each of the `L` tables samples `H` random unit-length hyperplane
//! normals at construction. A vector hashes in a table to an `H`-bit
//! signature (bit i = sign of the dot product with hyperplane i), packed
//! into a `u64`. Buckets map signatures to chunk id sets; a global entry
//! map keeps every id's normalized vector and per-table signatures so
//! removal is O(L).
//!
//! Search unions the buckets matching the query signature across tables.
//! If the candidate set stays under the oversample floor it also probes the
//! Hamming-1 neighborhood of the query signature in every table, then
//! exact-reranks by cosine. Queries with `k >= size()` shortcut to a full
//! exact scan, so large-k searches degrade to flat results rather than to
//! whatever the buckets happen to hold.

use crate::constants::{LSH_MIN_CANDIDATES, LSH_OVERSAMPLE_FACTOR};
use crate::error::{Error, Result};
use crate::index::{check_dim, dot, l2_normalize, rank_candidates, Filter, ScoredHit, VectorIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

struct Table {
    /// `H` unit-length hyperplane normals.
    hyperplanes: Vec<Vec<f32>>,
    buckets: HashMap<u64, HashSet<Uuid>>,
}

impl Table {
    fn signature(&self, vector: &[f32]) -> u64 {
        let mut sig = 0u64;
        for (bit, plane) in self.hyperplanes.iter().enumerate() {
            if dot(vector, plane) >= 0.0 {
                sig |= 1 << bit;
            }
        }
        sig
    }

    fn insert(&mut self, sig: u64, id: Uuid) {
        self.buckets.entry(sig).or_default().insert(id);
    }

    fn remove(&mut self, sig: u64, id: Uuid) {
        if let Some(bucket) = self.buckets.get_mut(&sig) {
            bucket.remove(&id);
            if bucket.is_empty() {
                self.buckets.remove(&sig);
            }
        }
    }
}

struct Entry {
    vector: Vec<f32>,
    /// Signature in each table, parallel to `tables`.
    signatures: Vec<u64>,
}

pub struct LshIndex {
    dim: usize,
    tables: Vec<Table>,
    entries: HashMap<Uuid, Entry>,
}

/// Standard-normal sample via Box-Muller; `rand` alone has no normal
/// distribution and the hyperplane directions must be uniform on the
/// sphere, which uniform cube samples are not.
fn sample_gaussian(rng: &mut StdRng) -> f32 {
    let mut u1: f32 = rng.gen();
    while u1 <= f32::EPSILON {
        u1 = rng.gen();
    }
    let u2: f32 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (std::f32::consts::TAU * u2).cos()
}

impl LshIndex {
    /// `num_tables` = L, `hyperplanes_per_table` = H (both validated by the
    /// index config; H is capped at 64 so a signature packs into a `u64`).
    pub fn new(dim: usize, num_tables: usize, hyperplanes_per_table: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let tables = (0..num_tables)
            .map(|_| {
                let hyperplanes = (0..hyperplanes_per_table)
                    .map(|_| {
                        let raw: Vec<f32> = (0..dim).map(|_| sample_gaussian(&mut rng)).collect();
                        // A degenerate all-zero draw is vanishingly unlikely;
                        // fall back to a basis vector rather than panic.
                        l2_normalize(&raw).unwrap_or_else(|_| {
                            let mut v = vec![0.0; dim];
                            v[0] = 1.0;
                            v
                        })
                    })
                    .collect();
                Table {
                    hyperplanes,
                    buckets: HashMap::new(),
                }
            })
            .collect();

        Self {
            dim,
            tables,
            entries: HashMap::new(),
        }
    }

    pub fn num_tables(&self) -> usize {
        self.tables.len()
    }

    pub fn hyperplanes_per_table(&self) -> usize {
        self.tables.first().map_or(0, |t| t.hyperplanes.len())
    }

    fn insert_normalized(&mut self, chunk_id: Uuid, vector: Vec<f32>) {
        let signatures: Vec<u64> = self.tables.iter().map(|t| t.signature(&vector)).collect();
        for (table, &sig) in self.tables.iter_mut().zip(&signatures) {
            table.insert(sig, chunk_id);
        }
        self.entries.insert(chunk_id, Entry { vector, signatures });
    }

    fn remove_entry(&mut self, chunk_id: Uuid) -> Option<Entry> {
        let entry = self.entries.remove(&chunk_id)?;
        for (table, &sig) in self.tables.iter_mut().zip(&entry.signatures) {
            table.remove(sig, chunk_id);
        }
        Some(entry)
    }
}

impl VectorIndex for LshIndex {
    fn add(&mut self, chunk_id: Uuid, vector: &[f32]) -> Result<()> {
        check_dim(self.dim, vector.len())?;
        let normalized = l2_normalize(vector)?;
        if self.entries.contains_key(&chunk_id) {
            return Err(Error::internal(format!(
                "chunk {chunk_id} already present in index"
            )));
        }
        self.insert_normalized(chunk_id, normalized);
        Ok(())
    }

    fn update(&mut self, chunk_id: Uuid, vector: &[f32]) -> Result<()> {
        check_dim(self.dim, vector.len())?;
        let normalized = l2_normalize(vector)?;
        if self.remove_entry(chunk_id).is_none() {
            return Err(Error::internal(format!(
                "chunk {chunk_id} absent from index"
            )));
        }
        self.insert_normalized(chunk_id, normalized);
        Ok(())
    }

    fn remove(&mut self, chunk_id: Uuid) {
        self.remove_entry(chunk_id);
    }

    fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<Filter<'_>>,
    ) -> Result<Vec<ScoredHit>> {
        check_dim(self.dim, query.len())?;
        let query_norm = l2_normalize(query)?;
        if k == 0 || self.entries.is_empty() {
            return Ok(Vec::new());
        }

        // With k at or above the population an exact scan is both cheaper
        // and strictly better than bucket probing.
        if k >= self.entries.len() {
            let all = self
                .entries
                .iter()
                .filter(|(id, _)| filter.map_or(true, |f| f(**id)))
                .map(|(id, e)| (*id, e.vector.as_slice()));
            return Ok(rank_candidates(&query_norm, all, k));
        }

        let floor = (k * LSH_OVERSAMPLE_FACTOR).max(LSH_MIN_CANDIDATES);
        let mut candidates: HashSet<Uuid> = HashSet::new();

        let signatures: Vec<u64> = self.tables.iter().map(|t| t.signature(&query_norm)).collect();
        for (table, &sig) in self.tables.iter().zip(&signatures) {
            if let Some(bucket) = table.buckets.get(&sig) {
                candidates.extend(bucket);
            }
        }

        // Below the oversample floor, widen to the Hamming-1 neighborhood
        // of the query signature, table by table, until the floor is met or
        // every table is exhausted.
        if candidates.len() < floor {
            'tables: for (table, &sig) in self.tables.iter().zip(&signatures) {
                for bit in 0..table.hyperplanes.len() {
                    if let Some(bucket) = table.buckets.get(&(sig ^ (1 << bit))) {
                        candidates.extend(bucket);
                    }
                    if candidates.len() >= floor {
                        break 'tables;
                    }
                }
            }
        }

        let admitted = candidates
            .into_iter()
            .filter(|id| filter.map_or(true, |f| f(*id)))
            .filter_map(|id| self.entries.get(&id).map(|e| (id, e.vector.as_slice())));

        Ok(rank_candidates(&query_norm, admitted, k))
    }

    fn rebuild(&mut self, entries: Vec<(Uuid, Vec<f32>)>) -> Result<()> {
        // Hyperplanes are sampled once at construction and survive rebuilds;
        // only the bucket state and entries are reconstructed.
        for table in &mut self.tables {
            table.buckets.clear();
        }
        self.entries.clear();

        for (chunk_id, vector) in entries {
            check_dim(self.dim, vector.len())?;
            let normalized = l2_normalize(&vector)?;
            self.insert_normalized(chunk_id, normalized);
        }
        Ok(())
    }

    fn size(&self) -> usize {
        self.entries.len()
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::FlatIndex;

    fn id(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn sphere_points(n: usize, dim: usize, seed: u64) -> Vec<(Uuid, Vec<f32>)> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|i| {
                let v: Vec<f32> = (0..dim).map(|_| rng.gen::<f32>() - 0.5).collect();
                (id(i as u128), v)
            })
            .collect()
    }

    #[test]
    fn test_deterministic_with_fixed_seed() {
        let points = sphere_points(64, 8, 7);
        let mut a = LshIndex::new(8, 4, 12, 42);
        let mut b = LshIndex::new(8, 4, 12, 42);
        a.rebuild(points.clone()).unwrap();
        b.rebuild(points.clone()).unwrap();

        let query = &points[3].1;
        let hits_a = a.search(query, 5, None).unwrap();
        let hits_b = b.search(query, 5, None).unwrap();
        assert_eq!(hits_a, hits_b);
    }

    #[test]
    fn test_matches_flat_when_k_covers_population() {
        let points = sphere_points(20, 6, 11);

        let mut lsh = LshIndex::new(6, 4, 8, 42);
        lsh.rebuild(points.clone()).unwrap();
        let mut flat = FlatIndex::new(6);
        flat.rebuild(points.clone()).unwrap();

        let query = vec![0.3, -0.2, 0.9, 0.1, 0.0, -0.5];
        let lsh_hits = lsh.search(&query, 20, None).unwrap();
        let flat_hits = flat.search(&query, 20, None).unwrap();

        let lsh_ids: Vec<Uuid> = lsh_hits.iter().map(|h| h.chunk_id).collect();
        let flat_ids: Vec<Uuid> = flat_hits.iter().map(|h| h.chunk_id).collect();
        assert_eq!(lsh_ids, flat_ids);
    }

    #[test]
    fn test_axis_fixture_ranks_like_flat() {
        // A=[1,0,0], B=[0.9,0.1,0], C=[0,1,0] under {lsh, L=4, H=8}.
        let mut index = LshIndex::new(3, 4, 8, 42);
        index.add(id(1), &[1.0, 0.0, 0.0]).unwrap();
        index.add(id(2), &[0.9, 0.1, 0.0]).unwrap();
        index.add(id(3), &[0.0, 1.0, 0.0]).unwrap();

        let hits = index.search(&[1.0, 0.0, 0.0], 2, None).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_id, id(1));
        assert_eq!(hits[1].chunk_id, id(2));
    }

    #[test]
    fn test_empty_index_and_removal() {
        let mut index = LshIndex::new(4, 2, 6, 1);
        assert!(index.search(&[1.0, 0.0, 0.0, 0.0], 3, None).unwrap().is_empty());

        index.add(id(1), &[1.0, 0.0, 0.0, 0.0]).unwrap();
        index.remove(id(1));
        index.remove(id(1));
        assert_eq!(index.size(), 0);
        assert!(index.search(&[1.0, 0.0, 0.0, 0.0], 3, None).unwrap().is_empty());
    }

    #[test]
    fn test_filter_restricts_candidates() {
        let mut index = LshIndex::new(3, 4, 8, 42);
        index.add(id(1), &[1.0, 0.0, 0.0]).unwrap();
        index.add(id(2), &[0.9, 0.1, 0.0]).unwrap();

        let only_two = |candidate: Uuid| candidate == id(2);
        let hits = index.search(&[1.0, 0.0, 0.0], 2, Some(&only_two)).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, id(2));
    }

    #[test]
    fn test_update_rehashes() {
        let mut index = LshIndex::new(3, 4, 8, 42);
        index.add(id(1), &[1.0, 0.0, 0.0]).unwrap();
        index.update(id(1), &[0.0, 1.0, 0.0]).unwrap();

        let hits = index.search(&[0.0, 1.0, 0.0], 1, None).unwrap();
        assert_eq!(hits[0].chunk_id, id(1));
        assert!((hits[0].score - 1.0).abs() < 1e-5);
    }
}
