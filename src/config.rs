//! User-facing configuration of an HNSW index.
//!
//! [`UserConfig`] is what the outer service layer hands to
//! [`HnswIndex::open`](crate::hnsw::HnswIndex::open) and later to
//! [`HnswIndex::update_user_config`](crate::hnsw::HnswIndex::update_user_config).
//! It serializes to and from JSON; missing fields take their defaults.
//!
//! ```
//! use quiver::config::UserConfig;
//! use quiver::distance::DistanceMetric;
//!
//! let config = UserConfig::from_json(r#"{"distance": "l2-squared", "ef": 100}"#).unwrap();
//! assert_eq!(config.distance, DistanceMetric::L2Squared);
//! assert_eq!(config.ef, Some(100));
//! assert_eq!(config.max_connections, 32);
//! ```

use serde::{Deserialize, Serialize};

use crate::distance::DistanceMetric;
use crate::error::{QuiverError, Result};

/// Default maximum out-degree per node per layer (M).
pub const DEFAULT_MAX_CONNECTIONS: usize = 32;
/// Default beam width used by insertion.
pub const DEFAULT_EF_CONSTRUCTION: usize = 128;
/// A cache budget this large means "keep everything in memory".
pub const UNBOUNDED_CACHE: usize = 1_000_000_000_000;
/// Largest node ID an index accepts. The graph and the growable cache are
/// arrays indexed by ID.
pub const MAX_NODE_ID: u64 = u32::MAX as u64;
/// Allow-lists smaller than this are searched exhaustively.
pub const DEFAULT_FLAT_SEARCH_CUTOFF: usize = 40_000;
/// Upper bound of the query-time beam width chosen automatically.
pub const MAX_AUTO_EF: usize = 100;

/// Product quantization settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PqConfig {
    /// Compress vectors with product quantization.
    pub enabled: bool,
    /// Number of segments (m). Zero means one segment per dimension.
    pub segments: usize,
    /// Centroids per segment (ks), at most 256 so a code fits one byte.
    pub centroids: usize,
    /// Maximum number of vectors used to train the codebooks.
    pub training_limit: usize,
    /// Seed for k-means initialization.
    pub seed: u64,
    /// Re-rank the final candidates with full-precision vectors.
    pub rescore: bool,
}

impl Default for PqConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            segments: 0,
            centroids: 256,
            training_limit: 100_000,
            seed: 42,
            rescore: true,
        }
    }
}

impl PqConfig {
    /// Segment count for vectors of `dimensions` components.
    pub fn segments_for(&self, dimensions: usize) -> usize {
        if self.segments == 0 {
            dimensions
        } else {
            self.segments
        }
    }

    /// Check that vectors of `dimensions` components split evenly into the
    /// configured segments. Zero dimensions (not known yet) always pass.
    pub fn validate_for(&self, dimensions: usize) -> Result<()> {
        if !self.enabled || dimensions == 0 {
            return Ok(());
        }
        let segments = self.segments_for(dimensions);
        if dimensions % segments != 0 {
            return Err(QuiverError::invalid_config(format!(
                "pq segments {segments} do not divide {dimensions} dimensions"
            )));
        }
        Ok(())
    }

    /// Validate the quantization parameters.
    pub fn validate(&self) -> Result<()> {
        if self.centroids == 0 || self.centroids > 256 {
            return Err(QuiverError::invalid_config(format!(
                "pq centroids must be in 1..=256, got {}",
                self.centroids
            )));
        }
        if self.enabled && self.training_limit < self.centroids {
            return Err(QuiverError::invalid_config(format!(
                "pq training limit {} is smaller than the centroid count {}",
                self.training_limit, self.centroids
            )));
        }
        Ok(())
    }
}

/// Configuration for an HNSW index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    /// Maximum connections per node at layers above 0 (M). Layer 0 allows 2·M.
    pub max_connections: usize,
    /// Beam width used by the search inside `add`.
    pub ef_construction: usize,
    /// Beam width used at query time. `None` derives it from k.
    pub ef: Option<usize>,
    /// Eviction budget of the vector cache.
    pub vector_cache_max_objects: usize,
    /// Distance metric. Immutable after creation.
    pub distance: DistanceMetric,
    /// Allow-lists smaller than this are searched without the graph.
    pub flat_search_cutoff: usize,
    /// Diversity factor of the neighbor-selection heuristic (1.0 = plain HNSW).
    pub heuristic_alpha: f32,
    /// Seed for layer assignment.
    pub seed: u64,
    /// Product quantization.
    pub pq: PqConfig,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            ef_construction: DEFAULT_EF_CONSTRUCTION,
            ef: None,
            vector_cache_max_objects: UNBOUNDED_CACHE,
            distance: DistanceMetric::default(),
            flat_search_cutoff: DEFAULT_FLAT_SEARCH_CUTOFF,
            heuristic_alpha: 1.0,
            seed: 42,
            pq: PqConfig::default(),
        }
    }
}

impl UserConfig {
    /// Parse a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: UserConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the M parameter (connections per node).
    pub fn with_max_connections(mut self, m: usize) -> Self {
        self.max_connections = m;
        self
    }

    /// Set the ef_construction parameter.
    pub fn with_ef_construction(mut self, ef_construction: usize) -> Self {
        self.ef_construction = ef_construction;
        self
    }

    /// Set a fixed query-time ef.
    pub fn with_ef(mut self, ef: usize) -> Self {
        self.ef = Some(ef);
        self
    }

    /// Set the distance metric.
    pub fn with_distance(mut self, distance: DistanceMetric) -> Self {
        self.distance = distance;
        self
    }

    /// Set the vector cache budget.
    pub fn with_vector_cache_max_objects(mut self, max: usize) -> Self {
        self.vector_cache_max_objects = max;
        self
    }

    /// Set the flat search cutoff.
    pub fn with_flat_search_cutoff(mut self, cutoff: usize) -> Self {
        self.flat_search_cutoff = cutoff;
        self
    }

    /// Set the layer-assignment seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the product quantization settings.
    pub fn with_pq(mut self, pq: PqConfig) -> Self {
        self.pq = pq;
        self
    }

    /// Maximum adjacency length at `layer`.
    pub fn max_connections_at(&self, layer: usize) -> usize {
        if layer == 0 {
            self.max_connections * 2
        } else {
            self.max_connections
        }
    }

    /// Whether the vector cache has a finite budget.
    pub fn cache_is_bounded(&self) -> bool {
        self.vector_cache_max_objects < UNBOUNDED_CACHE
    }

    /// Query-time beam width for a request of `k` results.
    pub fn search_ef(&self, k: usize) -> usize {
        self.ef.unwrap_or_else(|| reasonable_ef(k)).max(k)
    }

    /// Validate the configuration parameters.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(QuiverError::invalid_config("max_connections must be > 0"));
        }
        if self.ef_construction == 0 {
            return Err(QuiverError::invalid_config("ef_construction must be > 0"));
        }
        if self.ef == Some(0) {
            return Err(QuiverError::invalid_config("ef must be > 0"));
        }
        if self.vector_cache_max_objects == 0 {
            return Err(QuiverError::invalid_config(
                "vector_cache_max_objects must be > 0",
            ));
        }
        if !(self.heuristic_alpha >= 1.0) {
            return Err(QuiverError::invalid_config(format!(
                "heuristic_alpha must be >= 1.0, got {}",
                self.heuristic_alpha
            )));
        }
        if self.pq.enabled && self.distance == DistanceMetric::Hamming {
            return Err(QuiverError::invalid_config(
                "product quantization is not supported with the hamming distance",
            ));
        }
        self.pq.validate()
    }

    /// Check that `next` only changes fields that may change at runtime.
    pub fn validate_update(&self, next: &UserConfig) -> Result<()> {
        next.validate()?;
        if next.distance != self.distance {
            return Err(QuiverError::invalid_config(format!(
                "distance cannot be changed from {} to {}",
                self.distance, next.distance
            )));
        }
        if next.max_connections != self.max_connections {
            return Err(QuiverError::invalid_config(
                "max_connections cannot be changed after creation",
            ));
        }
        if self.pq.enabled && !next.pq.enabled {
            return Err(QuiverError::invalid_config(
                "product quantization cannot be disabled once enabled",
            ));
        }
        if self.pq.enabled
            && (next.pq.segments != self.pq.segments || next.pq.centroids != self.pq.centroids)
        {
            return Err(QuiverError::invalid_config(
                "pq segments and centroids cannot be changed once trained",
            ));
        }
        Ok(())
    }
}

/// Default query-time beam width for a request of `k` results.
pub fn reasonable_ef(k: usize) -> usize {
    (k * 8).max(k).min(MAX_AUTO_EF).max(k)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = UserConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_connections_at(0), 64);
        assert_eq!(config.max_connections_at(3), 32);
        assert!(!config.cache_is_bounded());
    }

    #[test]
    fn test_validation() {
        assert!(UserConfig::default().with_max_connections(0).validate().is_err());
        assert!(UserConfig::default().with_ef(0).validate().is_err());

        let mut config = UserConfig::default();
        config.heuristic_alpha = 0.5;
        assert!(config.validate().is_err());

        let config = UserConfig::default()
            .with_distance(DistanceMetric::Hamming)
            .with_pq(PqConfig {
                enabled: true,
                ..Default::default()
            });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reasonable_ef() {
        assert_eq!(reasonable_ef(1), 8);
        assert_eq!(reasonable_ef(10), 80);
        assert_eq!(reasonable_ef(50), 100);
        assert_eq!(reasonable_ef(500), 500);

        let config = UserConfig::default().with_ef(20);
        assert_eq!(config.search_ef(10), 20);
        assert_eq!(config.search_ef(40), 40);
    }

    #[test]
    fn test_update_rejects_immutable_fields() {
        let current = UserConfig::default();

        let next = current.clone().with_distance(DistanceMetric::Dot);
        assert!(current.validate_update(&next).is_err());

        let next = current.clone().with_max_connections(8);
        assert!(current.validate_update(&next).is_err());

        let next = current.clone().with_ef(64).with_vector_cache_max_objects(1000);
        assert!(current.validate_update(&next).is_ok());
    }

    #[test]
    fn test_json_round_trip_keeps_defaults() {
        let config = UserConfig::from_json(r#"{"pq": {"enabled": true, "segments": 8}}"#).unwrap();
        assert!(config.pq.enabled);
        assert_eq!(config.pq.segments, 8);
        assert_eq!(config.pq.centroids, 256);
        assert_eq!(config.pq.segments_for(64), 8);

        let json = serde_json::to_string(&config).unwrap();
        let back: UserConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);

        assert!(UserConfig::from_json(r#"{"distance": "manhattan"}"#).is_err());
    }

    #[test]
    fn test_pq_segments_must_divide_dimensions() {
        let pq = PqConfig {
            enabled: true,
            segments: 3,
            ..Default::default()
        };
        assert!(pq.validate_for(0).is_ok());
        assert!(pq.validate_for(9).is_ok());
        assert!(pq.validate_for(4).is_err());

        let disabled = PqConfig {
            enabled: false,
            ..pq
        };
        assert!(disabled.validate_for(4).is_ok());
    }
}
