//! Distance providers for vector similarity calculation.
//!
//! A [`DistanceProvider`] computes a scalar dissimilarity between two vectors:
//! smaller is more similar, and every provider is commutative and
//! deterministic. [`Distancer`] binds a provider to one query so per-query
//! work (such as normalizing for cosine) happens once.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{QuiverError, Result};
use crate::util::simd;

/// Distance metrics supported by the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DistanceMetric {
    /// Cosine distance (1 - cosine similarity). Vectors are normalized on entry.
    #[default]
    #[serde(rename = "cosine")]
    Cosine,
    /// Squared euclidean distance.
    #[serde(rename = "l2-squared", alias = "l2")]
    L2Squared,
    /// Negative dot product.
    #[serde(rename = "dot")]
    Dot,
    /// Number of differing components.
    #[serde(rename = "hamming")]
    Hamming,
}

impl DistanceMetric {
    /// The provider implementing this metric.
    pub fn provider(&self) -> &'static dyn DistanceProvider {
        match self {
            DistanceMetric::Cosine => &CosineDistance,
            DistanceMetric::L2Squared => &L2SquaredDistance,
            DistanceMetric::Dot => &DotDistance,
            DistanceMetric::Hamming => &HammingDistance,
        }
    }

    /// Calculate the distance between two vectors using this metric.
    pub fn distance(&self, a: &[f32], b: &[f32]) -> Result<f32> {
        self.provider().distance(a, b)
    }

    /// Get the name of this distance metric.
    pub fn name(&self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::L2Squared => "l2-squared",
            DistanceMetric::Dot => "dot",
            DistanceMetric::Hamming => "hamming",
        }
    }

    /// Parse a distance metric from a string.
    pub fn parse_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "cosine" => Ok(DistanceMetric::Cosine),
            "l2-squared" | "l2" | "euclidean" => Ok(DistanceMetric::L2Squared),
            "dot" | "dot_product" => Ok(DistanceMetric::Dot),
            "hamming" => Ok(DistanceMetric::Hamming),
            _ => Err(QuiverError::invalid_input(format!(
                "unknown distance metric: {s}"
            ))),
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A pure dissimilarity function over float vectors.
pub trait DistanceProvider: Send + Sync + fmt::Debug {
    /// The metric this provider implements.
    fn metric(&self) -> DistanceMetric;

    /// Distance between two arbitrary vectors.
    ///
    /// Fails with `InvalidInput` when the lengths differ.
    fn distance(&self, a: &[f32], b: &[f32]) -> Result<f32>;

    /// Distance between two vectors that both went through [`prepare`].
    ///
    /// [`prepare`]: DistanceProvider::prepare
    fn prepared_distance(&self, a: &[f32], b: &[f32]) -> Result<f32> {
        self.distance(a, b)
    }

    /// Bring a vector into the form the index stores (e.g. unit length).
    fn prepare(&self, _vector: &mut [f32]) {}
}

fn check_lengths(a: usize, b: usize) -> Result<()> {
    if a != b {
        return Err(QuiverError::invalid_input(format!(
            "vector lengths differ: {a} vs {b}"
        )));
    }
    Ok(())
}

/// Squared euclidean distance.
#[derive(Debug, Clone, Copy, Default)]
pub struct L2SquaredDistance;

impl DistanceProvider for L2SquaredDistance {
    fn metric(&self) -> DistanceMetric {
        DistanceMetric::L2Squared
    }

    fn distance(&self, a: &[f32], b: &[f32]) -> Result<f32> {
        check_lengths(a.len(), b.len())?;
        Ok(simd::l2_squared(a, b))
    }
}

/// Negative dot product, so that larger products sort first.
#[derive(Debug, Clone, Copy, Default)]
pub struct DotDistance;

impl DistanceProvider for DotDistance {
    fn metric(&self) -> DistanceMetric {
        DistanceMetric::Dot
    }

    fn distance(&self, a: &[f32], b: &[f32]) -> Result<f32> {
        check_lengths(a.len(), b.len())?;
        Ok(-simd::dot_product(a, b))
    }
}

/// Cosine distance.
///
/// The index normalizes vectors on entry, so distances between stored
/// vectors reduce to `1 - dot`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineDistance;

impl DistanceProvider for CosineDistance {
    fn metric(&self) -> DistanceMetric {
        DistanceMetric::Cosine
    }

    fn distance(&self, a: &[f32], b: &[f32]) -> Result<f32> {
        check_lengths(a.len(), b.len())?;
        let norms = simd::norm(a) * simd::norm(b);
        if norms == 0.0 {
            // zero vectors are maximally distant from everything
            return Ok(1.0);
        }
        Ok(1.0 - simd::dot_product(a, b) / norms)
    }

    fn prepared_distance(&self, a: &[f32], b: &[f32]) -> Result<f32> {
        check_lengths(a.len(), b.len())?;
        Ok(1.0 - simd::dot_product(a, b))
    }

    fn prepare(&self, vector: &mut [f32]) {
        simd::normalize_in_place(vector);
    }
}

/// Hamming distance: the number of positions at which the operands differ.
#[derive(Debug, Clone, Copy, Default)]
pub struct HammingDistance;

impl HammingDistance {
    /// Bitwise hamming distance between two byte strings.
    pub fn distance_bytes(&self, a: &[u8], b: &[u8]) -> Result<f32> {
        hamming_bytes(a, b)
    }
}

impl DistanceProvider for HammingDistance {
    fn metric(&self) -> DistanceMetric {
        DistanceMetric::Hamming
    }

    fn distance(&self, a: &[f32], b: &[f32]) -> Result<f32> {
        check_lengths(a.len(), b.len())?;
        Ok(a.iter().zip(b).filter(|(x, y)| x != y).count() as f32)
    }
}

/// Sum of `popcount(a[i] ^ b[i])` over both byte strings.
pub fn hamming_bytes(a: &[u8], b: &[u8]) -> Result<f32> {
    check_lengths(a.len(), b.len())?;
    let bits: u32 = a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum();
    Ok(bits as f32)
}

/// A provider bound to one prepared query vector.
#[derive(Debug, Clone)]
pub struct Distancer {
    provider: &'static dyn DistanceProvider,
    query: Vec<f32>,
}

impl Distancer {
    /// Bind `provider` to `query`, preparing the query once.
    pub fn new(provider: &'static dyn DistanceProvider, query: &[f32]) -> Self {
        let mut query = query.to_vec();
        provider.prepare(&mut query);
        Self { provider, query }
    }

    /// Distance from the bound query to a prepared vector.
    pub fn distance(&self, other: &[f32]) -> Result<f32> {
        self.provider.prepared_distance(&self.query, other)
    }

    /// The prepared query.
    pub fn query(&self) -> &[f32] {
        &self.query
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    fn random_vector(rng: &mut StdRng, dim: usize) -> Vec<f32> {
        (0..dim).map(|_| rng.random_range(-1.0..1.0)).collect()
    }

    #[test]
    fn test_hamming_bytes_concrete_cases() {
        assert_eq!(hamming_bytes(&[0b1010_1010], &[0b1010_1010]).unwrap(), 0.0);
        assert_eq!(hamming_bytes(&[0b1010_1010], &[0b0101_0101]).unwrap(), 8.0);
        assert_eq!(hamming_bytes(&[0b0011_1100], &[0b1111_0000]).unwrap(), 4.0);
        assert!(hamming_bytes(&[1, 2], &[1]).is_err());
    }

    #[test]
    fn test_hamming_floats_counts_differences() {
        let d = DistanceMetric::Hamming
            .distance(&[1.0, 2.0, 3.0, 4.0], &[1.0, 0.0, 3.0, 5.0])
            .unwrap();
        assert_eq!(d, 2.0);
    }

    #[test]
    fn test_symmetry() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let a = random_vector(&mut rng, 67);
            let b = random_vector(&mut rng, 67);
            for metric in [DistanceMetric::L2Squared, DistanceMetric::Cosine] {
                let ab = metric.distance(&a, &b).unwrap();
                let ba = metric.distance(&b, &a).unwrap();
                assert_eq!(ab, ba, "{metric} is not symmetric");
            }
        }
    }

    #[test]
    fn test_dimension_mismatch() {
        let err = DistanceMetric::L2Squared
            .distance(&[1.0, 2.0], &[1.0])
            .unwrap_err();
        assert!(err.is_invalid_input());
    }

    #[test]
    fn test_l2_and_dot_values() {
        let a = [1.0, 2.0, 3.0];
        let b = [4.0, 6.0, 3.0];
        assert_eq!(DistanceMetric::L2Squared.distance(&a, &b).unwrap(), 25.0);
        assert_eq!(DistanceMetric::Dot.distance(&a, &b).unwrap(), -25.0);
    }

    #[test]
    fn test_cosine_distancer_matches_full_formula() {
        let query = [3.0, 4.0];
        let mut stored = vec![4.0, 3.0];
        let provider = DistanceMetric::Cosine.provider();
        provider.prepare(&mut stored);

        let distancer = Distancer::new(provider, &query);
        let fast = distancer.distance(&stored).unwrap();
        let full = provider.distance(&query, &[4.0, 3.0]).unwrap();
        assert!((fast - full).abs() < 1e-6);
        assert!((full - (1.0 - 24.0 / 25.0)).abs() < 1e-6);
    }

    #[test]
    fn test_parse_and_serde_names() {
        assert_eq!(
            DistanceMetric::parse_str("L2").unwrap(),
            DistanceMetric::L2Squared
        );
        assert!(DistanceMetric::parse_str("manhattan").is_err());

        let json = serde_json::to_string(&DistanceMetric::L2Squared).unwrap();
        assert_eq!(json, "\"l2-squared\"");
        let parsed: DistanceMetric = serde_json::from_str("\"dot\"").unwrap();
        assert_eq!(parsed, DistanceMetric::Dot);
    }
}
