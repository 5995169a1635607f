//! Vector caches that feed vectors to the graph.
//!
//! Two interchangeable implementations sit behind [`VectorCache`]:
//!
//! - [`GrowableCache`]: one atomically swappable slot per ID. Reads are a
//!   lock-free load; growth swaps in a larger backing array. Use it when the
//!   whole dataset fits in memory.
//! - [`ShardedCache`]: a bounded cache split into lock-striped shards,
//!   evicting approximately least-recently-used entries when over budget.
//!
//! Both resolve misses through a [`Fetcher`], normally a closure around the
//! [`VectorStore`](crate::store::VectorStore). A fetch that fails with
//! `NotFound` is returned to the caller untouched; nothing is cached.

pub mod growable;
pub mod sharded;

use std::fmt;
use std::sync::Arc;

use crate::context::Context;
use crate::error::Result;

pub use self::growable::GrowableCache;
pub use self::sharded::ShardedCache;

/// A cached vector (or byte code) shared between readers.
pub type CachedVector<T> = Arc<Vec<T>>;

/// Resolves a cache miss.
pub type Fetcher<T> = Arc<dyn Fn(&Context, u64) -> Result<Vec<T>> + Send + Sync>;

/// A mapping from dense IDs to vectors.
pub trait VectorCache<T>: Send + Sync + fmt::Debug {
    /// Return the vector of `id`, fetching and caching it on a miss.
    fn get(&self, ctx: &Context, id: u64) -> Result<CachedVector<T>>;

    /// Return the vector of `id` only if it is already cached.
    fn get_cached(&self, id: u64) -> Option<CachedVector<T>>;

    /// Put a vector into the cache without consulting the fetcher.
    fn preload(&self, id: u64, vector: CachedVector<T>);

    /// Drop the vector of `id`.
    fn delete(&self, id: u64);

    /// Make room for IDs below `size`.
    fn grow(&self, size: usize);

    /// Number of cached vectors.
    fn len(&self) -> usize;

    /// Whether the cache holds nothing.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached vector.
    fn drain(&self);

    /// Change the eviction budget. Unbounded caches ignore it.
    fn update_max_size(&self, size: usize);

    /// Current eviction budget.
    fn max_size(&self) -> usize;
}

/// Convert a freshly fetched vector into a shareable cache entry.
pub(crate) fn entry<T>(vector: Vec<T>) -> CachedVector<T> {
    Arc::new(vector)
}
