use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use quiver::prelude::*;

fn generate_vectors(count: usize, dim: usize, seed: u64) -> Vec<(u64, Vec<f32>)> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|i| (i as u64, (0..dim).map(|_| rng.random::<f32>()).collect()))
        .collect()
}

fn build_index(vectors: &[(u64, Vec<f32>)], dim: usize) -> HnswIndex {
    let store = Arc::new(MemoryVectorStore::new());
    for (id, vector) in vectors {
        store.put(*id, vector.clone());
    }
    let config = UserConfig::default()
        .with_distance(DistanceMetric::Cosine)
        .with_max_connections(16)
        .with_ef_construction(128);
    let index = HnswIndex::open(IndexOptions::new("bench", dim, store).with_config(config)).unwrap();
    index.add_batch(&Context::background(), vectors).unwrap();
    index
}

fn bench_hnsw_construction(c: &mut Criterion) {
    let mut group = c.benchmark_group("HNSW Construction");
    group.sample_size(10);
    let dim = 128;

    for count in [1000, 5000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            let vectors = generate_vectors(count, dim, 1);
            b.iter(|| build_index(&vectors, dim));
        });
    }
    group.finish();
}

fn bench_hnsw_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("HNSW Search");
    let dim = 128;
    let index = build_index(&generate_vectors(5000, dim, 2), dim);
    let queries = generate_vectors(64, dim, 3);
    let ctx = Context::background();

    for k in [1, 10, 50] {
        group.bench_with_input(BenchmarkId::new("search_by_vector", k), &k, |b, &k| {
            let mut next = 0usize;
            b.iter(|| {
                let (_, query) = &queries[next % queries.len()];
                next += 1;
                index.search_by_vector(&ctx, query, k, None).unwrap()
            })
        });
    }

    let allowed = AllowList::from_ids((0..5000).step_by(10));
    group.bench_function("search_filtered_flat", |b| {
        b.iter(|| {
            index
                .search_by_vector(&ctx, &queries[0].1, 10, Some(&allowed))
                .unwrap()
        })
    });

    group.finish();
}

criterion_group!(benches, bench_hnsw_construction, bench_hnsw_search);
criterion_main!(benches);
