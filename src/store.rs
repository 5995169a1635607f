//! The object-store collaborator that resolves a document ID to its vector.
//!
//! The index never owns the authoritative copy of a vector. On a cache miss
//! it asks the [`VectorStore`]; a [`QuiverError::NotFound`] answer means the
//! object was deleted underneath the graph, and the caller tombstones the
//! node instead of failing.

use std::fmt;
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::context::Context;
use crate::error::{QuiverError, Result};

/// Resolves document IDs to raw vectors.
pub trait VectorStore: Send + Sync + fmt::Debug {
    /// Fetch the vector of `id`. Fails with `NotFound` if the object is gone.
    fn vector_for_id(&self, ctx: &Context, id: u64) -> Result<Vec<f32>>;
}

/// A store kept entirely in memory.
///
/// Useful for tests and for embedding the index without an external
/// key-value store.
#[derive(Debug, Default)]
pub struct MemoryVectorStore {
    vectors: RwLock<AHashMap<u64, Arc<[f32]>>>,
}

impl MemoryVectorStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the vector of `id`.
    pub fn put(&self, id: u64, vector: Vec<f32>) {
        self.vectors.write().insert(id, Arc::from(vector));
    }

    /// Remove the vector of `id`, returning whether it existed.
    pub fn remove(&self, id: u64) -> bool {
        self.vectors.write().remove(&id).is_some()
    }

    /// Number of stored vectors.
    pub fn len(&self) -> usize {
        self.vectors.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.vectors.read().is_empty()
    }
}

impl VectorStore for MemoryVectorStore {
    fn vector_for_id(&self, ctx: &Context, id: u64) -> Result<Vec<f32>> {
        ctx.check("vector for id")?;
        self.vectors
            .read()
            .get(&id)
            .map(|v| v.to_vec())
            .ok_or_else(|| QuiverError::not_found(format!("object {id}")))
    }
}
