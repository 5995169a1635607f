use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use quiver::config::PqConfig;
use quiver::distance::{DistanceMetric, hamming_bytes};
use quiver::quantization::ProductQuantizer;

fn generate_test_vectors(count: usize, dimension: usize) -> Vec<Vec<f32>> {
    let mut vectors = Vec::with_capacity(count);
    for i in 0..count {
        let mut data = Vec::with_capacity(dimension);
        for j in 0..dimension {
            let value = ((i as f32 * 0.1 + j as f32 * 0.01).sin() * 0.5 + 0.5) * 2.0 - 1.0;
            data.push(value);
        }
        vectors.push(data);
    }
    vectors
}

fn bench_distances(c: &mut Criterion) {
    let dimension = 128;
    let vectors = generate_test_vectors(101, dimension);
    let query = &vectors[0];
    let targets = &vectors[1..101];

    let mut group = c.benchmark_group("distance_metrics");

    for metric in [
        DistanceMetric::Cosine,
        DistanceMetric::L2Squared,
        DistanceMetric::Dot,
        DistanceMetric::Hamming,
    ] {
        group.bench_function(metric.name(), |b| {
            b.iter(|| {
                for target in targets {
                    let _ = black_box(
                        metric
                            .distance(black_box(query), black_box(target))
                            .unwrap(),
                    );
                }
            })
        });
    }

    let codes: Vec<Vec<u8>> = (0..101u32)
        .map(|i| (0..64u32).map(|j| (i * 31 + j * 7) as u8).collect())
        .collect();
    group.bench_function("hamming_bytes", |b| {
        b.iter(|| {
            for code in &codes[1..] {
                let _ = black_box(hamming_bytes(black_box(&codes[0]), black_box(code)).unwrap());
            }
        })
    });

    group.finish();
}

fn bench_pq_lookup(c: &mut Criterion) {
    let dimension = 128;
    let vectors = generate_test_vectors(2000, dimension);
    let config = PqConfig {
        enabled: true,
        segments: 16,
        centroids: 64,
        ..PqConfig::default()
    };
    let quantizer = std::sync::Arc::new(
        ProductQuantizer::fit(&config, dimension, DistanceMetric::L2Squared, &vectors).unwrap(),
    );
    let codes: Vec<Vec<u8>> = vectors[..100]
        .iter()
        .map(|v| quantizer.encode(v).unwrap())
        .collect();

    c.bench_function("pq_lookup_distance", |b| {
        let mut lookup = quantizer.center_at(&vectors[1999]).unwrap();
        b.iter(|| {
            for code in &codes {
                let _ = black_box(lookup.distance(black_box(code)).unwrap());
            }
        })
    });
}

criterion_group!(benches, bench_distances, bench_pq_lookup);
criterion_main!(benches);
