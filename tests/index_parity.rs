//! Cross-strategy properties: with `k` covering the population, every
//! strategy must return the flat (exact) result; below that, ANN hits must
//! be a subset of the population with exact scores.

use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use uuid::Uuid;
use vecbase::index::{AnyIndex, VectorIndex};
use vecbase::model::IndexConfig;

const DIM: usize = 8;

fn dataset(n: usize, seed: u64) -> Vec<(Uuid, Vec<f32>)> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|i| {
            let v: Vec<f32> = (0..DIM).map(|_| rng.gen::<f32>() * 2.0 - 1.0).collect();
            (Uuid::from_u128(i as u128), v)
        })
        .collect()
}

fn strategies() -> Vec<IndexConfig> {
    vec![
        IndexConfig::Flat,
        IndexConfig::Lsh {
            num_tables: 4,
            hyperplanes_per_table: 10,
        },
        IndexConfig::Ivf {
            num_centroids: 4,
            nprobe: 2,
        },
    ]
}

#[test]
fn test_rebuild_then_full_k_matches_flat_for_all_strategies() {
    let points = dataset(40, 3);
    let query: Vec<f32> = vec![0.4, -0.1, 0.8, 0.0, 0.3, -0.7, 0.2, 0.1];

    let mut flat = AnyIndex::from_config(&IndexConfig::Flat, DIM).unwrap();
    flat.rebuild(points.clone()).unwrap();
    let expected = flat.search(&query, points.len(), None).unwrap();
    assert_eq!(expected.len(), points.len());

    for config in strategies() {
        let mut index = AnyIndex::from_config(&config, DIM).unwrap();
        index.rebuild(points.clone()).unwrap();

        let hits = index.search(&query, points.len(), None).unwrap();
        let got: Vec<Uuid> = hits.iter().map(|h| h.chunk_id).collect();
        let want: Vec<Uuid> = expected.iter().map(|h| h.chunk_id).collect();
        assert_eq!(got, want, "strategy {} diverged from flat", config.kind());
    }
}

#[test]
fn test_ann_scores_are_exact_for_returned_ids() {
    let points = dataset(60, 5);
    let query: Vec<f32> = vec![0.9, 0.1, -0.2, 0.4, 0.0, 0.3, -0.5, 0.6];

    let mut flat = AnyIndex::from_config(&IndexConfig::Flat, DIM).unwrap();
    flat.rebuild(points.clone()).unwrap();
    let oracle = flat.search(&query, points.len(), None).unwrap();

    for config in strategies() {
        let mut index = AnyIndex::from_config(&config, DIM).unwrap();
        index.rebuild(points.clone()).unwrap();

        for hit in index.search(&query, 10, None).unwrap() {
            let reference = oracle
                .iter()
                .find(|h| h.chunk_id == hit.chunk_id)
                .expect("ANN returned an id outside the population");
            assert!(
                (hit.score - reference.score).abs() < 1e-5,
                "strategy {} mis-scored {}",
                config.kind(),
                hit.chunk_id
            );
        }
    }
}

#[test]
fn test_mutation_round_trip_restores_membership() {
    for config in strategies() {
        let mut index = AnyIndex::from_config(&config, DIM).unwrap();
        index.rebuild(dataset(20, 9)).unwrap();
        let size_before = index.size();

        let extra = Uuid::from_u128(10_000);
        let vector: Vec<f32> = (0..DIM).map(|i| (i as f32 + 1.0) * 0.1).collect();
        index.add(extra, &vector).unwrap();
        index.remove(extra);

        assert_eq!(index.size(), size_before, "strategy {}", config.kind());
        let hits = index.search(&vector, size_before, None).unwrap();
        assert!(
            hits.iter().all(|h| h.chunk_id != extra),
            "strategy {} kept a removed id",
            config.kind()
        );
    }
}

#[test]
fn test_fixed_seed_reproducibility_across_instances() {
    let points = dataset(50, 21);
    let query: Vec<f32> = vec![0.1, 0.9, 0.2, -0.4, 0.5, 0.0, -0.3, 0.7];

    for config in strategies() {
        let mut first = AnyIndex::from_config(&config, DIM).unwrap();
        let mut second = AnyIndex::from_config(&config, DIM).unwrap();
        first.rebuild(points.clone()).unwrap();
        second.rebuild(points.clone()).unwrap();

        let a = first.search(&query, 7, None).unwrap();
        let b = second.search(&query, 7, None).unwrap();
        let a_ids: Vec<(Uuid, String)> = a
            .iter()
            .map(|h| (h.chunk_id, format!("{:.6}", h.score)))
            .collect();
        let b_ids: Vec<(Uuid, String)> = b
            .iter()
            .map(|h| (h.chunk_id, format!("{:.6}", h.score)))
            .collect();
        assert_eq!(a_ids, b_ids, "strategy {} not deterministic", config.kind());
    }
}
