//! # Quiver
//!
//! A concurrent HNSW approximate nearest neighbor index for Rust.
//!
//! ## Features
//!
//! - Layered HNSW graph with a diversity-preserving neighbor heuristic
//! - Lock-free growable and bounded sharded vector caches
//! - Product quantization with rescoring against full vectors
//! - Tombstone deletion with a background cleanup pass
//! - Crash-safe commit log replayed on open
//! - L2, dot, cosine and hamming distances with SIMD kernels
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use quiver::prelude::*;
//!
//! # fn main() -> quiver::error::Result<()> {
//! let store = Arc::new(MemoryVectorStore::new());
//! let index = HnswIndex::open(IndexOptions::new("docs", 3, store.clone()))?;
//! let ctx = Context::background();
//!
//! for (id, vector) in [(1, [1.0, 0.0, 0.0]), (2, [0.0, 1.0, 0.0])] {
//!     store.put(id, vector.to_vec());
//!     index.add(&ctx, id, &vector)?;
//! }
//!
//! let results = index.search_by_vector(&ctx, &[0.9, 0.1, 0.0], 1, None)?;
//! assert_eq!(results.ids, vec![1]);
//! # Ok(())
//! # }
//! ```

pub mod allow_list;
pub mod cache;
pub mod config;
pub mod context;
pub mod distance;
pub mod error;
pub mod hnsw;
pub mod quantization;
pub mod storage;
pub mod store;
pub mod util;

pub mod prelude {
    pub use crate::allow_list::AllowList;
    pub use crate::config::{PqConfig, UserConfig};
    pub use crate::context::Context;
    pub use crate::distance::DistanceMetric;
    pub use crate::error::{QuiverError, Result};
    pub use crate::hnsw::{HnswIndex, IndexOptions, IndexStats, SearchResults};
    pub use crate::storage::Storage;
    pub use crate::storage::file::{FileStorage, FileStorageConfig};
    pub use crate::storage::memory::MemoryStorage;
    pub use crate::store::{MemoryVectorStore, VectorStore};
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
