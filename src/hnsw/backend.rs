//! Swappable access to the vectors behind graph nodes.
//!
//! The graph never touches vectors directly. It asks a [`VectorBackend`] for
//! a [`QueryDistancer`] bound to a query (or to an existing node) and feeds
//! it node IDs. Two backends exist:
//!
//! - [`InMemoryBackend`]: full-precision floats in a vector cache.
//! - [`DiskBackend`]: product-quantized byte codes in a vector cache, with
//!   full vectors read from the object store only for rescoring.
//!
//! The index switches from the first to the second on compression. A node
//! whose vector the store no longer has, or returns with the wrong number of
//! components, resolves to `Ok(None)`, which the caller treats as "skip and
//! tombstone".

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::cache::{CachedVector, Fetcher, GrowableCache, ShardedCache, VectorCache};
use crate::config::UserConfig;
use crate::context::Context;
use crate::distance::{DistanceMetric, DistanceProvider, Distancer};
use crate::error::{QuiverError, Result, ResultExt};
use crate::hnsw::candidates::Candidate;
use crate::quantization::{DistanceLookup, ProductQuantizer};
use crate::store::VectorStore;

/// Distances from one fixed point to graph nodes.
pub trait QueryDistancer {
    /// Distance to node `id`, or `None` if its vector no longer exists.
    fn distance(&mut self, ctx: &Context, id: u64) -> Result<Option<f32>>;
}

/// Outcome of re-ranking candidates with full-precision vectors.
#[derive(Debug, Default)]
pub struct Rescored {
    pub candidates: Vec<Candidate>,
    pub missing: Vec<u64>,
}

/// Vector access used by search, insert and cleanup.
pub trait VectorBackend: Send + Sync + fmt::Debug {
    /// Whether vectors are held as product-quantized codes.
    fn is_compressed(&self) -> bool;

    /// Distancer bound to a prepared query vector.
    fn query_distancer<'a>(&'a self, query: &[f32]) -> Result<Box<dyn QueryDistancer + 'a>>;

    /// Distancer bound to the vector of an existing node.
    fn node_distancer<'a>(
        &'a self,
        ctx: &Context,
        id: u64,
    ) -> Result<Option<Box<dyn QueryDistancer + 'a>>>;

    /// Cache the prepared vector of a new node.
    fn preload(&self, id: u64, vector: &[f32]) -> Result<()>;

    /// The full-precision prepared vector of `id`.
    fn vector(&self, ctx: &Context, id: u64) -> Result<Option<Vec<f32>>>;

    /// Load the cache entry of `id`. Returns false if the vector is gone.
    fn prefetch(&self, ctx: &Context, id: u64) -> Result<bool>;

    /// Re-rank candidates with exact distances. Backends holding exact
    /// vectors already return the input unchanged.
    fn rescore(&self, ctx: &Context, query: &[f32], candidates: Vec<Candidate>)
    -> Result<Rescored>;

    /// The trained quantizer, if compressed.
    fn quantizer(&self) -> Option<Arc<ProductQuantizer>>;

    /// Forget the cached vector of `id`.
    fn delete(&self, id: u64);

    /// Make room for IDs below `size`.
    fn grow(&self, size: usize);

    /// Number of cached entries.
    fn cache_len(&self) -> usize;

    /// Change the cache eviction budget.
    fn update_max_size(&self, size: usize);

    /// Drop every cached entry.
    fn drain(&self);
}

/// Map `NotFound` to `None`; everything else stays an error.
pub(crate) fn resolve<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

fn make_cache<T: Send + Sync + 'static>(
    config: &UserConfig,
    capacity: usize,
    fetcher: Fetcher<T>,
) -> Box<dyn VectorCache<T>> {
    if config.cache_is_bounded() {
        Box::new(ShardedCache::new(config.vector_cache_max_objects, fetcher))
    } else {
        Box::new(GrowableCache::new(capacity, fetcher))
    }
}

/// A stored vector of the wrong length is as unusable as a missing one.
fn check_shape(id: u64, vector: &[f32], expected: usize) -> Result<()> {
    if expected != 0 && vector.len() != expected {
        return Err(QuiverError::not_found(format!(
            "object {id} has {} dimensions, expected {expected}",
            vector.len()
        )));
    }
    Ok(())
}

fn float_fetcher(
    store: Arc<dyn VectorStore>,
    metric: DistanceMetric,
    dimensions: Arc<AtomicUsize>,
) -> Fetcher<f32> {
    let provider = metric.provider();
    Arc::new(move |ctx, id| {
        let mut vector = store.vector_for_id(ctx, id)?;
        check_shape(id, &vector, dimensions.load(Ordering::Acquire))?;
        provider.prepare(&mut vector);
        Ok(vector)
    })
}

fn code_fetcher(
    store: Arc<dyn VectorStore>,
    metric: DistanceMetric,
    quantizer: Arc<ProductQuantizer>,
) -> Fetcher<u8> {
    let provider = metric.provider();
    Arc::new(move |ctx, id| {
        let mut vector = store.vector_for_id(ctx, id)?;
        check_shape(id, &vector, quantizer.dimensions())?;
        provider.prepare(&mut vector);
        quantizer.encode(&vector)
    })
}

/// Build the backend matching `config`, compressed when a quantizer is given.
pub(crate) fn build_backend(
    config: &UserConfig,
    store: Arc<dyn VectorStore>,
    dimensions: Arc<AtomicUsize>,
    quantizer: Option<Arc<ProductQuantizer>>,
    capacity: usize,
) -> Arc<dyn VectorBackend> {
    match quantizer {
        Some(quantizer) => Arc::new(DiskBackend::new(config, store, quantizer, capacity)),
        None => Arc::new(InMemoryBackend::new(config, store, dimensions, capacity)),
    }
}

/// Full-precision vectors in memory.
#[derive(Debug)]
pub struct InMemoryBackend {
    provider: &'static dyn DistanceProvider,
    cache: Box<dyn VectorCache<f32>>,
}

impl InMemoryBackend {
    /// Stored vectors whose length differs from `dimensions` (when non-zero)
    /// are treated as missing.
    pub fn new(
        config: &UserConfig,
        store: Arc<dyn VectorStore>,
        dimensions: Arc<AtomicUsize>,
        capacity: usize,
    ) -> Self {
        let fetcher = float_fetcher(store, config.distance, dimensions);
        Self {
            provider: config.distance.provider(),
            cache: make_cache(config, capacity, fetcher),
        }
    }

    fn get(&self, ctx: &Context, id: u64) -> Result<Option<CachedVector<f32>>> {
        resolve(self.cache.get(ctx, id)).context_with(|| format!("vector of node {id}"))
    }
}

struct FloatDistancer<'a> {
    backend: &'a InMemoryBackend,
    distancer: Distancer,
}

impl QueryDistancer for FloatDistancer<'_> {
    fn distance(&mut self, ctx: &Context, id: u64) -> Result<Option<f32>> {
        match self.backend.get(ctx, id)? {
            Some(vector) => self.distancer.distance(&vector).map(Some),
            None => Ok(None),
        }
    }
}

impl VectorBackend for InMemoryBackend {
    fn is_compressed(&self) -> bool {
        false
    }

    fn query_distancer<'a>(&'a self, query: &[f32]) -> Result<Box<dyn QueryDistancer + 'a>> {
        Ok(Box::new(FloatDistancer {
            backend: self,
            distancer: Distancer::new(self.provider, query),
        }))
    }

    fn node_distancer<'a>(
        &'a self,
        ctx: &Context,
        id: u64,
    ) -> Result<Option<Box<dyn QueryDistancer + 'a>>> {
        Ok(self.get(ctx, id)?.map(|vector| {
            Box::new(FloatDistancer {
                backend: self,
                distancer: Distancer::new(self.provider, &vector),
            }) as Box<dyn QueryDistancer + 'a>
        }))
    }

    fn preload(&self, id: u64, vector: &[f32]) -> Result<()> {
        self.cache.preload(id, Arc::new(vector.to_vec()));
        Ok(())
    }

    fn vector(&self, ctx: &Context, id: u64) -> Result<Option<Vec<f32>>> {
        Ok(self.get(ctx, id)?.map(|v| v.to_vec()))
    }

    fn prefetch(&self, ctx: &Context, id: u64) -> Result<bool> {
        Ok(self.get(ctx, id)?.is_some())
    }

    fn rescore(
        &self,
        _ctx: &Context,
        _query: &[f32],
        candidates: Vec<Candidate>,
    ) -> Result<Rescored> {
        Ok(Rescored {
            candidates,
            missing: Vec::new(),
        })
    }

    fn quantizer(&self) -> Option<Arc<ProductQuantizer>> {
        None
    }

    fn delete(&self, id: u64) {
        self.cache.delete(id);
    }

    fn grow(&self, size: usize) {
        self.cache.grow(size);
    }

    fn cache_len(&self) -> usize {
        self.cache.len()
    }

    fn update_max_size(&self, size: usize) {
        self.cache.update_max_size(size);
    }

    fn drain(&self) {
        self.cache.drain();
    }
}

/// Product-quantized codes in memory, full vectors in the object store.
#[derive(Debug)]
pub struct DiskBackend {
    provider: &'static dyn DistanceProvider,
    quantizer: Arc<ProductQuantizer>,
    codes: Box<dyn VectorCache<u8>>,
    store: Arc<dyn VectorStore>,
    rescore: bool,
}

impl DiskBackend {
    pub fn new(
        config: &UserConfig,
        store: Arc<dyn VectorStore>,
        quantizer: Arc<ProductQuantizer>,
        capacity: usize,
    ) -> Self {
        let fetcher = code_fetcher(store.clone(), config.distance, quantizer.clone());
        Self {
            provider: config.distance.provider(),
            quantizer,
            codes: make_cache(config, capacity, fetcher),
            store,
            rescore: config.pq.rescore,
        }
    }

    fn code(&self, ctx: &Context, id: u64) -> Result<Option<CachedVector<u8>>> {
        resolve(self.codes.get(ctx, id)).context_with(|| format!("code of node {id}"))
    }

    /// Cache an already encoded vector.
    pub fn preload_code(&self, id: u64, code: Vec<u8>) {
        self.codes.preload(id, Arc::new(code));
    }
}

struct LookupDistancer<'a> {
    backend: &'a DiskBackend,
    lookup: DistanceLookup,
}

impl QueryDistancer for LookupDistancer<'_> {
    fn distance(&mut self, ctx: &Context, id: u64) -> Result<Option<f32>> {
        match self.backend.code(ctx, id)? {
            Some(code) => self.lookup.distance(&code).map(Some),
            None => Ok(None),
        }
    }
}

struct CodeDistancer<'a> {
    backend: &'a DiskBackend,
    code: CachedVector<u8>,
}

impl QueryDistancer for CodeDistancer<'_> {
    fn distance(&mut self, ctx: &Context, id: u64) -> Result<Option<f32>> {
        match self.backend.code(ctx, id)? {
            Some(other) => self
                .backend
                .quantizer
                .distance_between_codes(&self.code, &other)
                .map(Some),
            None => Ok(None),
        }
    }
}

impl VectorBackend for DiskBackend {
    fn is_compressed(&self) -> bool {
        true
    }

    fn query_distancer<'a>(&'a self, query: &[f32]) -> Result<Box<dyn QueryDistancer + 'a>> {
        Ok(Box::new(LookupDistancer {
            backend: self,
            lookup: self.quantizer.center_at(query)?,
        }))
    }

    fn node_distancer<'a>(
        &'a self,
        ctx: &Context,
        id: u64,
    ) -> Result<Option<Box<dyn QueryDistancer + 'a>>> {
        Ok(self.code(ctx, id)?.map(|code| {
            Box::new(CodeDistancer {
                backend: self,
                code,
            }) as Box<dyn QueryDistancer + 'a>
        }))
    }

    fn preload(&self, id: u64, vector: &[f32]) -> Result<()> {
        self.preload_code(id, self.quantizer.encode(vector)?);
        Ok(())
    }

    fn vector(&self, ctx: &Context, id: u64) -> Result<Option<Vec<f32>>> {
        let fetched = self.store.vector_for_id(ctx, id).and_then(|vector| {
            check_shape(id, &vector, self.quantizer.dimensions())?;
            Ok(vector)
        });
        let vector = resolve(fetched).context_with(|| format!("vector of node {id}"))?;
        Ok(vector.map(|mut v| {
            self.provider.prepare(&mut v);
            v
        }))
    }

    fn prefetch(&self, ctx: &Context, id: u64) -> Result<bool> {
        Ok(self.code(ctx, id)?.is_some())
    }

    fn rescore(
        &self,
        ctx: &Context,
        query: &[f32],
        candidates: Vec<Candidate>,
    ) -> Result<Rescored> {
        if !self.rescore {
            return Ok(Rescored {
                candidates,
                missing: Vec::new(),
            });
        }

        let distancer = Distancer::new(self.provider, query);
        let mut rescored = Rescored::default();
        for candidate in candidates {
            ctx.check("rescore")?;
            match self.vector(ctx, candidate.id)? {
                Some(vector) => rescored
                    .candidates
                    .push(Candidate::new(candidate.id, distancer.distance(&vector)?)),
                None => rescored.missing.push(candidate.id),
            }
        }
        rescored.candidates.sort();
        Ok(rescored)
    }

    fn quantizer(&self) -> Option<Arc<ProductQuantizer>> {
        Some(self.quantizer.clone())
    }

    fn delete(&self, id: u64) {
        self.codes.delete(id);
    }

    fn grow(&self, size: usize) {
        self.codes.grow(size);
    }

    fn cache_len(&self) -> usize {
        self.codes.len()
    }

    fn update_max_size(&self, size: usize) {
        self.codes.update_max_size(size);
    }

    fn drain(&self) {
        self.codes.drain();
    }
}
