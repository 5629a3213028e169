//! Inverted-file index over spherical k-means centroids.
//!
//! Training runs k-means++ seeding followed by Lloyd iterations on the
//! normalized dataset: assignment by maximum dot product, centroid
//! recomputation as the normalized mean, empty centroids re-seeded from the
//! farthest point of the most populous cluster, halting on stable
//! assignments or the iteration cap. If the dataset holds fewer points
//! than `num_centroids`, the effective centroid count is reduced to the
//! dataset size.
//!
//! Incremental inserts assign to the nearest existing centroid. Once the
//! post-train insertions exceed `IVF_DRIFT_THRESHOLD` of the trained set
//! size, the retrain is folded into the mutation that crossed the line —
//! the caller already holds the library's write lock there, so searches
//! never observe a half-trained index.

use crate::constants::{IVF_DRIFT_THRESHOLD, KMEANS_MAX_ITERS};
use crate::error::{Error, Result};
use crate::index::{check_dim, dot, l2_normalize, rank_candidates, Filter, ScoredHit, VectorIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::collections::HashMap;
use uuid::Uuid;

struct Entry {
    vector: Vec<f32>,
    /// Posting list this entry currently lives in; `None` only while the
    /// index is untrained.
    centroid: Option<usize>,
}

pub struct IvfIndex {
    dim: usize,
    num_centroids: usize,
    nprobe: usize,
    centroids: Vec<Vec<f32>>,
    postings: Vec<Vec<Uuid>>,
    entries: HashMap<Uuid, Entry>,
    trained_size: usize,
    inserts_since_train: usize,
    rng: StdRng,
}

impl IvfIndex {
    pub fn new(dim: usize, num_centroids: usize, nprobe: usize, seed: u64) -> Self {
        Self {
            dim,
            num_centroids,
            nprobe,
            centroids: Vec::new(),
            postings: Vec::new(),
            entries: HashMap::new(),
            trained_size: 0,
            inserts_since_train: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn num_centroids(&self) -> usize {
        self.num_centroids
    }

    pub fn nprobe(&self) -> usize {
        self.nprobe
    }

    #[cfg(test)]
    pub(crate) fn trained_size(&self) -> usize {
        self.trained_size
    }

    fn nearest_centroid(centroids: &[Vec<f32>], vector: &[f32]) -> usize {
        let mut best = 0;
        let mut best_score = f32::NEG_INFINITY;
        for (i, c) in centroids.iter().enumerate() {
            let score = dot(c, vector);
            if score > best_score {
                best_score = score;
                best = i;
            }
        }
        best
    }

    /// Squared cosine distance to the nearest of the chosen centroids,
    /// the k-means++ sampling weight.
    fn seed_weight(centroids: &[Vec<f32>], vector: &[f32]) -> f64 {
        let mut best = f64::INFINITY;
        for c in centroids {
            let d = 1.0 - dot(c, vector) as f64;
            if d < best {
                best = d;
            }
        }
        (best.max(0.0)).powi(2)
    }

    /// Spherical k-means over the full entry set. Dataset order is fixed by
    /// sorting on chunk id so training is reproducible across runs.
    fn train(&mut self) {
        let mut dataset: Vec<(Uuid, Vec<f32>)> = self
            .entries
            .iter()
            .map(|(id, e)| (*id, e.vector.clone()))
            .collect();
        dataset.sort_by_key(|(id, _)| *id);

        let n = dataset.len();
        self.trained_size = n;
        self.inserts_since_train = 0;

        if n == 0 {
            self.centroids.clear();
            self.postings.clear();
            return;
        }

        let k = self.num_centroids.min(n);

        // k-means++ seeding.
        let mut centroids: Vec<Vec<f32>> = Vec::with_capacity(k);
        let first = self.rng.gen_range(0..n);
        centroids.push(dataset[first].1.clone());
        while centroids.len() < k {
            let weights: Vec<f64> = dataset
                .iter()
                .map(|(_, v)| Self::seed_weight(&centroids, v))
                .collect();
            let total: f64 = weights.iter().sum();
            let pick = if total <= f64::EPSILON {
                self.rng.gen_range(0..n)
            } else {
                let mut target = self.rng.gen::<f64>() * total;
                let mut chosen = n - 1;
                for (i, w) in weights.iter().enumerate() {
                    target -= w;
                    if target <= 0.0 {
                        chosen = i;
                        break;
                    }
                }
                chosen
            };
            centroids.push(dataset[pick].1.clone());
        }

        // Lloyd iterations: assign by max dot, recompute normalized means.
        let mut assignments: Vec<usize> = vec![0; n];
        for _ in 0..KMEANS_MAX_ITERS {
            let next: Vec<usize> = dataset
                .par_iter()
                .map(|(_, v)| Self::nearest_centroid(&centroids, v))
                .collect();

            let stable = next == assignments;
            assignments = next;

            let mut sums: Vec<Vec<f32>> = vec![vec![0.0; self.dim]; centroids.len()];
            let mut counts: Vec<usize> = vec![0; centroids.len()];
            for ((_, v), &a) in dataset.iter().zip(&assignments) {
                for (acc, x) in sums[a].iter_mut().zip(v) {
                    *acc += x;
                }
                counts[a] += 1;
            }

            for (i, count) in counts.iter().enumerate() {
                if *count == 0 {
                    // Re-seed an empty centroid from the farthest point of
                    // the most populous cluster.
                    let crowded = counts
                        .iter()
                        .enumerate()
                        .max_by_key(|(_, c)| **c)
                        .map(|(idx, _)| idx)
                        .unwrap_or(0);
                    let farthest = dataset
                        .iter()
                        .zip(assignments.iter())
                        .filter(|pair| *pair.1 == crowded)
                        .map(|(point, _)| &point.1)
                        .min_by(|x, y| {
                            dot(&centroids[crowded], x).total_cmp(&dot(&centroids[crowded], y))
                        })
                        .cloned();
                    if let Some(v) = farthest {
                        centroids[i] = v;
                    }
                    continue;
                }
                if let Ok(normalized) = l2_normalize(&sums[i]) {
                    centroids[i] = normalized;
                }
                // A cancelling mean keeps the previous centroid.
            }

            if stable {
                break;
            }
        }

        // Final assignment against the settled centroids.
        let final_assignments: Vec<usize> = dataset
            .par_iter()
            .map(|(_, v)| Self::nearest_centroid(&centroids, v))
            .collect();

        let mut postings: Vec<Vec<Uuid>> = vec![Vec::new(); centroids.len()];
        for ((id, _), &a) in dataset.iter().zip(&final_assignments) {
            postings[a].push(*id);
        }
        for ((id, _), &a) in dataset.iter().zip(&final_assignments) {
            if let Some(entry) = self.entries.get_mut(id) {
                entry.centroid = Some(a);
            }
        }

        self.centroids = centroids;
        self.postings = postings;
    }

    fn maybe_retrain(&mut self) {
        let baseline = self.trained_size.max(1);
        if self.inserts_since_train as f64 > IVF_DRIFT_THRESHOLD * baseline as f64 {
            self.train();
        }
    }

    fn unassign(&mut self, chunk_id: Uuid) {
        if let Some(entry) = self.entries.get(&chunk_id) {
            if let Some(c) = entry.centroid {
                if let Some(posting) = self.postings.get_mut(c) {
                    if let Some(pos) = posting.iter().position(|id| *id == chunk_id) {
                        posting.swap_remove(pos);
                    }
                }
            }
        }
    }

    fn assign(&mut self, chunk_id: Uuid, vector: Vec<f32>) {
        let centroid = if self.centroids.is_empty() {
            None
        } else {
            let c = Self::nearest_centroid(&self.centroids, &vector);
            self.postings[c].push(chunk_id);
            Some(c)
        };
        self.entries.insert(chunk_id, Entry { vector, centroid });
    }
}

impl VectorIndex for IvfIndex {
    fn add(&mut self, chunk_id: Uuid, vector: &[f32]) -> Result<()> {
        check_dim(self.dim, vector.len())?;
        let normalized = l2_normalize(vector)?;
        if self.entries.contains_key(&chunk_id) {
            return Err(Error::internal(format!(
                "chunk {chunk_id} already present in index"
            )));
        }
        self.assign(chunk_id, normalized);
        self.inserts_since_train += 1;
        self.maybe_retrain();
        Ok(())
    }

    fn update(&mut self, chunk_id: Uuid, vector: &[f32]) -> Result<()> {
        check_dim(self.dim, vector.len())?;
        let normalized = l2_normalize(vector)?;
        if !self.entries.contains_key(&chunk_id) {
            return Err(Error::internal(format!(
                "chunk {chunk_id} absent from index"
            )));
        }
        self.unassign(chunk_id);
        self.entries.remove(&chunk_id);
        self.assign(chunk_id, normalized);
        // A moved vector drifts the partition as much as a fresh one.
        self.inserts_since_train += 1;
        self.maybe_retrain();
        Ok(())
    }

    fn remove(&mut self, chunk_id: Uuid) {
        self.unassign(chunk_id);
        self.entries.remove(&chunk_id);
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

        // Untrained (or k covers the population): exact scan.
        if self.centroids.is_empty() || k >= self.entries.len() {
            let all = self
                .entries
                .iter()
                .filter(|(id, _)| filter.map_or(true, |f| f(**id)))
                .map(|(id, e)| (*id, e.vector.as_slice()));
            return Ok(rank_candidates(&query_norm, all, k));
        }

        // Probe the nprobe best centroids.
        let mut scored: Vec<(usize, f32)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(i, c)| (i, dot(c, &query_norm)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let admitted = scored
            .iter()
            .take(self.nprobe)
            .flat_map(|(c, _)| self.postings[*c].iter())
            .filter(|id| filter.map_or(true, |f| f(**id)))
            .filter_map(|id| self.entries.get(id).map(|e| (*id, e.vector.as_slice())));

        Ok(rank_candidates(&query_norm, admitted, k))
    }

    fn rebuild(&mut self, entries: Vec<(Uuid, Vec<f32>)>) -> Result<()> {
        let mut normalized = HashMap::with_capacity(entries.len());
        for (chunk_id, vector) in entries {
            check_dim(self.dim, vector.len())?;
            normalized.insert(
                chunk_id,
                Entry {
                    vector: l2_normalize(&vector)?,
                    centroid: None,
                },
            );
        }
        self.entries = normalized;
        self.centroids.clear();
        self.postings.clear();
        self.train();
        Ok(())
    }

    fn size(&self) -> usize {
        self.entries.len()
    }

    fn dim(&self) -> usize {
        self.dim
    }
}
