use std::sync::Arc;

use quiver::error::Result;
use quiver::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_vectors(rng: &mut StdRng, count: usize, dim: usize) -> Vec<Vec<f32>> {
    (0..count)
        .map(|_| (0..dim).map(|_| rng.random::<f32>()).collect())
        .collect()
}

fn exact_top_k(data: &[Vec<f32>], query: &[f32], k: usize) -> Result<Vec<u64>> {
    let mut scored = Vec::with_capacity(data.len());
    for (id, vector) in data.iter().enumerate() {
        scored.push((DistanceMetric::L2Squared.distance(query, vector)?, id as u64));
    }
    scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    Ok(scored.into_iter().take(k).map(|(_, id)| id).collect())
}

fn measure_recall(
    count: usize,
    dim: usize,
    m: usize,
    ef_construction: usize,
    ef: usize,
    k: usize,
) -> Result<f64> {
    let mut rng = StdRng::seed_from_u64(2024);
    let data = random_vectors(&mut rng, count, dim);
    let queries = random_vectors(&mut rng, 100, dim);

    let store = Arc::new(MemoryVectorStore::new());
    for (id, vector) in data.iter().enumerate() {
        store.put(id as u64, vector.clone());
    }
    let config = UserConfig::default()
        .with_distance(DistanceMetric::L2Squared)
        .with_max_connections(m)
        .with_ef_construction(ef_construction)
        .with_ef(ef);
    let index = HnswIndex::open(IndexOptions::new("recall", dim, store).with_config(config))?;

    let items: Vec<(u64, Vec<f32>)> = data
        .iter()
        .enumerate()
        .map(|(id, vector)| (id as u64, vector.clone()))
        .collect();
    let ctx = Context::background();
    index.add_batch(&ctx, &items)?;
    assert_eq!(index.len(), count);

    let mut hits = 0usize;
    for query in &queries {
        let results = index.search_by_vector(&ctx, query, k, None)?;
        assert_eq!(results.len(), k);
        let truth = exact_top_k(&data, query, k)?;
        hits += results.ids.iter().filter(|id| truth.contains(id)).count();
    }
    Ok(hits as f64 / (queries.len() * k) as f64)
}

#[test]
fn test_recall_small() -> Result<()> {
    let recall = measure_recall(1500, 24, 16, 64, 64, 10)?;
    assert!(recall > 0.9, "recall@10 was {recall}");
    Ok(())
}

#[test]
fn test_recall_10k_128d() -> Result<()> {
    let recall = measure_recall(10_000, 128, 32, 64, 100, 10)?;
    assert!(recall > 0.9, "recall@10 was {recall}");
    Ok(())
}
