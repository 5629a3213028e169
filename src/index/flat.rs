//! Exact brute-force index.
//!
//! Stores `{chunk_id -> normalized vector}` and scans linearly on search,
//! keeping a bounded min-heap of size `k`. O(N·d) per search, O(d) per
//! mutation. Exact results; the correctness oracle for the ANN strategies.

use crate::error::{Error, Result};
use crate::index::{check_dim, l2_normalize, rank_candidates, Filter, ScoredHit, VectorIndex};
use std::collections::HashMap;
use uuid::Uuid;

pub struct FlatIndex {
    dim: usize,
    vectors: HashMap<Uuid, Vec<f32>>,
}

impl FlatIndex {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            vectors: HashMap::new(),
        }
    }
}

impl VectorIndex for FlatIndex {
    fn add(&mut self, chunk_id: Uuid, vector: &[f32]) -> Result<()> {
        check_dim(self.dim, vector.len())?;
        let normalized = l2_normalize(vector)?;
        if self.vectors.contains_key(&chunk_id) {
            return Err(Error::internal(format!(
                "chunk {chunk_id} already present in index"
            )));
        }
        self.vectors.insert(chunk_id, normalized);
        Ok(())
    }

    fn update(&mut self, chunk_id: Uuid, vector: &[f32]) -> Result<()> {
        check_dim(self.dim, vector.len())?;
        let normalized = l2_normalize(vector)?;
        match self.vectors.get_mut(&chunk_id) {
            Some(slot) => {
                *slot = normalized;
                Ok(())
            }
            None => Err(Error::internal(format!(
                "chunk {chunk_id} absent from index"
            ))),
        }
    }

    fn remove(&mut self, chunk_id: Uuid) {
        self.vectors.remove(&chunk_id);
    }

    fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<Filter<'_>>,
    ) -> Result<Vec<ScoredHit>> {
        check_dim(self.dim, query.len())?;
        let query_norm = l2_normalize(query)?;

        let candidates = self
            .vectors
            .iter()
            .filter(|(id, _)| filter.map_or(true, |f| f(**id)))
            .map(|(id, v)| (*id, v.as_slice()));

        Ok(rank_candidates(&query_norm, candidates, k))
    }

    fn rebuild(&mut self, entries: Vec<(Uuid, Vec<f32>)>) -> Result<()> {
        let mut vectors = HashMap::with_capacity(entries.len());
        for (chunk_id, vector) in entries {
            check_dim(self.dim, vector.len())?;
            vectors.insert(chunk_id, l2_normalize(&vector)?);
        }
        self.vectors = vectors;
        Ok(())
    }

    fn size(&self) -> usize {
        self.vectors.len()
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    #[test]
    fn test_hand_computed_cosine_ground_truth() {
        // Library with dim 3: A=[1,0,0], B=[0.9,0.1,0], C=[0,1,0].
        let mut index = FlatIndex::new(3);
        index.add(id(1), &[1.0, 0.0, 0.0]).unwrap();
        index.add(id(2), &[0.9, 0.1, 0.0]).unwrap();
        index.add(id(3), &[0.0, 1.0, 0.0]).unwrap();

        let hits = index.search(&[1.0, 0.0, 0.0], 2, None).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_id, id(1));
        assert!((hits[0].score - 1.0).abs() < 1e-5);
        assert_eq!(hits[1].chunk_id, id(2));
        // cos = 0.9 / sqrt(0.81 + 0.01) ≈ 0.99446
        assert!((hits[1].score - 0.99446).abs() < 1e-4);
    }

    #[test]
    fn test_add_duplicate_fails_update_requires_presence() {
        let mut index = FlatIndex::new(2);
        index.add(id(1), &[1.0, 0.0]).unwrap();

        assert!(index.add(id(1), &[0.0, 1.0]).is_err());
        assert!(index.update(id(2), &[0.0, 1.0]).is_err());
        assert!(index.update(id(1), &[0.0, 1.0]).is_ok());
    }

    #[test]
    fn test_dimension_and_zero_vector_rejected() {
        let mut index = FlatIndex::new(3);
        assert!(matches!(
            index.add(id(1), &[1.0, 0.0]),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            index.add(id(1), &[0.0, 0.0, 0.0]),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            index.search(&[1.0], 5, None),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_add_then_remove_round_trip() {
        let mut index = FlatIndex::new(2);
        index.add(id(1), &[1.0, 0.0]).unwrap();
        let size_before = index.size();

        index.add(id(2), &[0.0, 1.0]).unwrap();
        index.remove(id(2));

        assert_eq!(index.size(), size_before);
        let hits = index.search(&[0.0, 1.0], 10, None).unwrap();
        assert!(hits.iter().all(|h| h.chunk_id != id(2)));

        // Idempotent: removing again is a no-op.
        index.remove(id(2));
        assert_eq!(index.size(), size_before);
    }

    #[test]
    fn test_filter_applies_before_selection() {
        let mut index = FlatIndex::new(2);
        index.add(id(1), &[1.0, 0.0]).unwrap();
        index.add(id(2), &[0.9, 0.1]).unwrap();
        index.add(id(3), &[0.0, 1.0]).unwrap();

        let exclude_best = |candidate: Uuid| candidate != id(1);
        let hits = index
            .search(&[1.0, 0.0], 1, Some(&exclude_best))
            .unwrap();

        // Top-k contains only admissible items, not a truncated unfiltered
        // ranking.
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, id(2));
    }

    #[test]
    fn test_empty_index_returns_empty() {
        let index = FlatIndex::new(2);
        assert!(index.search(&[1.0, 0.0], 5, None).unwrap().is_empty());
    }

    #[test]
    fn test_rebuild_replaces_state() {
        let mut index = FlatIndex::new(2);
        index.add(id(1), &[1.0, 0.0]).unwrap();

        index
            .rebuild(vec![(id(2), vec![0.0, 1.0]), (id(3), vec![1.0, 1.0])])
            .unwrap();

        assert_eq!(index.size(), 2);
        let hits = index.search(&[1.0, 0.0], 5, None).unwrap();
        assert!(hits.iter().all(|h| h.chunk_id != id(1)));
    }
}
