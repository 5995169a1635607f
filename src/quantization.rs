//! Product quantization for compressed vector storage.
//!
//! A [`ProductQuantizer`] splits every vector into `m` equal contiguous
//! segments and replaces each segment by the index of its nearest centroid in
//! a per-segment codebook of `ks <= 256` entries, so a vector becomes `m`
//! bytes. Distances against a query are answered through a
//! [`DistanceLookup`], which memoizes the query-to-centroid partial distance
//! of every (segment, centroid) pair the first time it is needed.
//!
//! Codebooks are trained with k-means: random initialization, then repeated
//! assign / recompute rounds, re-seeding clusters that ran empty, until fewer
//! than [`CONVERGENCE_RATIO`] of the training points change cluster or
//! [`MAX_ITERATIONS`] is reached.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::PqConfig;
use crate::distance::DistanceMetric;
use crate::error::{QuiverError, Result};
use crate::util::simd;

/// Upper bound of k-means rounds per segment.
pub const MAX_ITERATIONS: usize = 25;
/// k-means stops once fewer than this share of points change cluster.
pub const CONVERGENCE_RATIO: f32 = 0.01;

/// Trained codebooks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductQuantizer {
    dimensions: usize,
    segments: usize,
    centroids: usize,
    metric: DistanceMetric,
    /// One flattened `centroids x segment_len` matrix per segment.
    codebooks: Vec<Vec<f32>>,
}

impl ProductQuantizer {
    /// Train codebooks over `training`.
    ///
    /// Cosine data is expected to be normalized already; its partial
    /// distances are computed as negative dot products.
    pub fn fit(
        config: &PqConfig,
        dimensions: usize,
        metric: DistanceMetric,
        training: &[Vec<f32>],
    ) -> Result<Self> {
        if metric == DistanceMetric::Hamming {
            return Err(QuiverError::invalid_input(
                "product quantization does not support the hamming distance",
            ));
        }
        let segments = config.segments_for(dimensions);
        if segments == 0 || dimensions % segments != 0 {
            return Err(QuiverError::invalid_input(format!(
                "{dimensions} dimensions cannot be split into {segments} equal segments"
            )));
        }
        if config.centroids == 0 || config.centroids > 256 {
            return Err(QuiverError::invalid_input(format!(
                "pq centroids must be in 1..=256, got {}",
                config.centroids
            )));
        }
        if training.len() < config.centroids {
            return Err(QuiverError::invalid_input(format!(
                "need at least {} training vectors, got {}",
                config.centroids,
                training.len()
            )));
        }
        if let Some(bad) = training.iter().find(|v| v.len() != dimensions) {
            return Err(QuiverError::invalid_input(format!(
                "training vector has {} dimensions, expected {dimensions}",
                bad.len()
            )));
        }

        let segment_len = dimensions / segments;
        let codebooks: Vec<Vec<f32>> = (0..segments)
            .into_par_iter()
            .map(|segment| {
                let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(segment as u64));
                kmeans(
                    training,
                    segment * segment_len,
                    segment_len,
                    config.centroids,
                    &mut rng,
                )
            })
            .collect();

        debug!(
            dimensions,
            segments,
            centroids = config.centroids,
            training = training.len(),
            "product quantizer trained"
        );

        Ok(Self {
            dimensions,
            segments,
            centroids: config.centroids,
            metric,
            codebooks,
        })
    }

    /// Number of vector components.
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Number of segments (bytes per code).
    pub fn segments(&self) -> usize {
        self.segments
    }

    /// Number of centroids per segment.
    pub fn centroids(&self) -> usize {
        self.centroids
    }

    /// Metric the partial distances are computed in.
    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    #[inline]
    fn segment_len(&self) -> usize {
        self.dimensions / self.segments
    }

    #[inline]
    fn centroid(&self, segment: usize, code: u8) -> &[f32] {
        let len = self.segment_len();
        let start = code as usize * len;
        &self.codebooks[segment][start..start + len]
    }

    fn check_vector(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimensions {
            return Err(QuiverError::invalid_input(format!(
                "vector has {} dimensions, quantizer expects {}",
                vector.len(),
                self.dimensions
            )));
        }
        Ok(())
    }

    fn check_code(&self, code: &[u8]) -> Result<()> {
        if code.len() != self.segments {
            return Err(QuiverError::invalid_input(format!(
                "code has {} segments, quantizer expects {}",
                code.len(),
                self.segments
            )));
        }
        Ok(())
    }

    /// Encode `vector` as one centroid index per segment.
    pub fn encode(&self, vector: &[f32]) -> Result<Vec<u8>> {
        self.check_vector(vector)?;
        let len = self.segment_len();
        Ok((0..self.segments)
            .map(|segment| {
                let sub = &vector[segment * len..(segment + 1) * len];
                nearest(&self.codebooks[segment], sub, len) as u8
            })
            .collect())
    }

    /// Approximate reconstruction of an encoded vector.
    pub fn decode(&self, code: &[u8]) -> Result<Vec<f32>> {
        self.check_code(code)?;
        let mut out = Vec::with_capacity(self.dimensions);
        for (segment, &c) in code.iter().enumerate() {
            out.extend_from_slice(self.centroid(segment, c));
        }
        Ok(out)
    }

    #[inline]
    fn partial(&self, a: &[f32], b: &[f32]) -> f32 {
        match self.metric {
            DistanceMetric::L2Squared => simd::l2_squared(a, b),
            _ => -simd::dot_product(a, b),
        }
    }

    #[inline]
    fn finish(&self, sum: f32) -> f32 {
        match self.metric {
            DistanceMetric::Cosine => 1.0 + sum,
            _ => sum,
        }
    }

    /// Distance between two encoded vectors, computed centroid to centroid.
    pub fn distance_between_codes(&self, a: &[u8], b: &[u8]) -> Result<f32> {
        self.check_code(a)?;
        self.check_code(b)?;
        let sum = a
            .iter()
            .zip(b)
            .enumerate()
            .map(|(segment, (&x, &y))| {
                self.partial(self.centroid(segment, x), self.centroid(segment, y))
            })
            .sum();
        Ok(self.finish(sum))
    }

    /// Prepare a per-query lookup table.
    pub fn center_at(self: &Arc<Self>, query: &[f32]) -> Result<DistanceLookup> {
        self.check_vector(query)?;
        Ok(DistanceLookup {
            quantizer: Arc::clone(self),
            query: query.to_vec(),
            table: vec![f32::NAN; self.segments * self.centroids],
        })
    }
}

/// Query-bound distances to encoded vectors.
///
/// Table entries start as NaN and are filled on first use, so a query that
/// only touches a few centroids never pays for the rest.
#[derive(Debug, Clone)]
pub struct DistanceLookup {
    quantizer: Arc<ProductQuantizer>,
    query: Vec<f32>,
    table: Vec<f32>,
}

impl DistanceLookup {
    /// Approximate distance from the query to `code`.
    pub fn distance(&mut self, code: &[u8]) -> Result<f32> {
        let pq = &self.quantizer;
        pq.check_code(code)?;
        let len = pq.segment_len();
        let mut sum = 0.0;
        for (segment, &c) in code.iter().enumerate() {
            let slot = segment * pq.centroids + c as usize;
            let mut partial = self.table[slot];
            if partial.is_nan() {
                let sub = &self.query[segment * len..(segment + 1) * len];
                partial = pq.partial(sub, pq.centroid(segment, c));
                self.table[slot] = partial;
            }
            sum += partial;
        }
        Ok(pq.finish(sum))
    }

    /// The query this table was built for.
    pub fn query(&self) -> &[f32] {
        &self.query
    }
}

fn nearest(codebook: &[f32], sub: &[f32], len: usize) -> usize {
    let mut best = 0;
    let mut best_distance = f32::INFINITY;
    for (i, centroid) in codebook.chunks_exact(len).enumerate() {
        let distance = simd::l2_squared(sub, centroid);
        if distance < best_distance {
            best_distance = distance;
            best = i;
        }
    }
    best
}

fn kmeans(
    training: &[Vec<f32>],
    offset: usize,
    len: usize,
    k: usize,
    rng: &mut StdRng,
) -> Vec<f32> {
    let n = training.len();
    let sub = |i: usize| &training[i][offset..offset + len];

    let mut codebook = Vec::with_capacity(k * len);
    for idx in rand::seq::index::sample(rng, n, k) {
        codebook.extend_from_slice(sub(idx));
    }

    let mut assignments = vec![usize::MAX; n];
    for _ in 0..MAX_ITERATIONS {
        let mut changed = 0;
        for (i, assignment) in assignments.iter_mut().enumerate() {
            let cluster = nearest(&codebook, sub(i), len);
            if *assignment != cluster {
                *assignment = cluster;
                changed += 1;
            }
        }

        let mut sums = vec![0.0f32; k * len];
        let mut counts = vec![0usize; k];
        for (i, &cluster) in assignments.iter().enumerate() {
            counts[cluster] += 1;
            for (acc, &x) in sums[cluster * len..(cluster + 1) * len]
                .iter_mut()
                .zip(sub(i))
            {
                *acc += x;
            }
        }

        for cluster in 0..k {
            let target = &mut codebook[cluster * len..(cluster + 1) * len];
            if counts[cluster] == 0 {
                // Empty cluster: re-seed from a random training point.
                target.copy_from_slice(sub(rng.random_range(0..n)));
                continue;
            }
            let count = counts[cluster] as f32;
            for (c, &s) in target.iter_mut().zip(&sums[cluster * len..(cluster + 1) * len]) {
                *c = s / count;
            }
        }

        if (changed as f32) < CONVERGENCE_RATIO * n as f32 {
            break;
        }
    }

    codebook
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clustered_data(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        let centers: Vec<Vec<f32>> = (0..8)
            .map(|_| (0..dim).map(|_| rng.random_range(-10.0..10.0)).collect())
            .collect();
        (0..n)
            .map(|i| {
                centers[i % centers.len()]
                    .iter()
                    .map(|c| c + rng.random_range(-0.1..0.1))
                    .collect()
            })
            .collect()
    }

    fn config(segments: usize, centroids: usize) -> PqConfig {
        PqConfig {
            enabled: true,
            segments,
            centroids,
            ..Default::default()
        }
    }

    #[test]
    fn test_encode_is_deterministic() {
        let data = clustered_data(300, 16, 1);
        let pq = ProductQuantizer::fit(&config(4, 16), 16, DistanceMetric::L2Squared, &data)
            .unwrap();
        for v in data.iter().take(20) {
            let a = pq.encode(v).unwrap();
            let b = pq.encode(v).unwrap();
            assert_eq!(a, b);
            assert_eq!(a.len(), 4);
        }
    }

    #[test]
    fn test_same_seed_same_codebooks() {
        let data = clustered_data(200, 8, 2);
        let a = ProductQuantizer::fit(&config(2, 8), 8, DistanceMetric::L2Squared, &data).unwrap();
        let b = ProductQuantizer::fit(&config(2, 8), 8, DistanceMetric::L2Squared, &data).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_decode_approximates_clustered_data() {
        let data = clustered_data(400, 16, 3);
        let pq = ProductQuantizer::fit(&config(4, 128), 16, DistanceMetric::L2Squared, &data)
            .unwrap();
        for v in data.iter().take(50) {
            let decoded = pq.decode(&pq.encode(v).unwrap()).unwrap();
            assert!(simd::l2_squared(v, &decoded) < 1.0);
        }
    }

    #[test]
    fn test_lookup_matches_decoded_distance() {
        let data = clustered_data(300, 12, 4);
        let pq = Arc::new(
            ProductQuantizer::fit(&config(3, 16), 12, DistanceMetric::L2Squared, &data).unwrap(),
        );
        let query = &data[7];
        let mut lookup = pq.center_at(query).unwrap();
        for v in data.iter().take(30) {
            let code = pq.encode(v).unwrap();
            let expected = simd::l2_squared(query, &pq.decode(&code).unwrap());
            let got = lookup.distance(&code).unwrap();
            assert!(
                (expected - got).abs() <= 1e-4 * expected.abs().max(1.0),
                "{expected} vs {got}"
            );
            // memoized second call
            assert_eq!(lookup.distance(&code).unwrap(), got);
        }
    }

    #[test]
    fn test_code_to_code_distance_is_symmetric() {
        let data = clustered_data(300, 8, 5);
        let pq = ProductQuantizer::fit(&config(0, 16), 8, DistanceMetric::Dot, &data).unwrap();
        assert_eq!(pq.segments(), 8);
        let a = pq.encode(&data[0]).unwrap();
        let b = pq.encode(&data[1]).unwrap();
        assert_eq!(
            pq.distance_between_codes(&a, &b).unwrap(),
            pq.distance_between_codes(&b, &a).unwrap()
        );
    }

    #[test]
    fn test_fit_rejects_bad_input() {
        let data = clustered_data(10, 8, 6);
        let err = ProductQuantizer::fit(&config(2, 16), 8, DistanceMetric::L2Squared, &data)
            .unwrap_err();
        assert!(err.is_invalid_input());

        let data = clustered_data(100, 8, 6);
        assert!(
            ProductQuantizer::fit(&config(3, 16), 8, DistanceMetric::L2Squared, &data).is_err()
        );
        assert!(ProductQuantizer::fit(&config(2, 16), 8, DistanceMetric::Hamming, &data).is_err());

        let pq = ProductQuantizer::fit(&config(2, 16), 8, DistanceMetric::L2Squared, &data)
            .unwrap();
        assert!(pq.encode(&[1.0; 4]).is_err());
        assert!(pq.decode(&[0]).is_err());
    }
}
