//! The index struct, replay on open, configuration updates and lifecycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::UserConfig;
use crate::context::Context;
use crate::distance::DistanceMetric;
use crate::error::{QuiverError, Result, ResultExt};
use crate::hnsw::backend::{VectorBackend, build_backend};
use crate::hnsw::commit_log::{CommitLog, LogEvent};
use crate::hnsw::graph::{Entrypoint, Graph, Node};
use crate::quantization::ProductQuantizer;
use crate::storage::Storage;
use crate::store::VectorStore;

/// Initial slot count of the vector cache.
const INITIAL_CAPACITY: usize = 1024;

/// Everything needed to open an index.
#[derive(Debug, Clone)]
pub struct IndexOptions {
    /// Identifier, also the prefix of every file the index owns.
    pub id: String,
    /// Vector length. Zero means "take it from the first vector added".
    pub dimensions: usize,
    pub config: UserConfig,
    /// Source of truth for vectors.
    pub store: Arc<dyn VectorStore>,
    /// Where the commit log lives. `None` keeps the index in memory only.
    pub storage: Option<Arc<dyn Storage>>,
}

impl IndexOptions {
    pub fn new<S: Into<String>>(id: S, dimensions: usize, store: Arc<dyn VectorStore>) -> Self {
        Self {
            id: id.into(),
            dimensions,
            config: UserConfig::default(),
            store,
            storage: None,
        }
    }

    pub fn with_config(mut self, config: UserConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }
}

/// Point-in-time counters of an index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    /// Nodes in the graph, tombstoned ones included.
    pub nodes: usize,
    pub tombstones: usize,
    /// Current top layer.
    pub max_level: usize,
    pub entrypoint: Option<u64>,
    pub dimensions: usize,
    pub cache_len: usize,
    pub compressed: bool,
    pub commit_log_bytes: u64,
}

/// A concurrent HNSW index over vectors owned by a [`VectorStore`].
///
/// All operations take `&self`; share the index across threads with an
/// `Arc`. See the `graph` module for the lock hierarchy.
#[derive(Debug)]
pub struct HnswIndex {
    pub(super) id: String,
    pub(super) dimensions: Arc<AtomicUsize>,
    pub(super) metric: DistanceMetric,
    pub(super) config: RwLock<UserConfig>,
    pub(super) graph: Graph,
    pub(super) backend: RwLock<Arc<dyn VectorBackend>>,
    pub(super) store: Arc<dyn VectorStore>,
    pub(super) storage: Option<Arc<dyn Storage>>,
    pub(super) commit_log: Option<CommitLog>,
    pub(super) rng: Mutex<StdRng>,
    pub(super) level_multiplier: f64,
    pub(super) paused: AtomicBool,
    pub(super) shut: AtomicBool,
    compressing: AtomicBool,
    /// A cache rebuild requested while maintenance was paused.
    rebuild_pending: AtomicBool,
}

impl HnswIndex {
    /// Open an index, replaying its commit log when storage is given.
    pub fn open(options: IndexOptions) -> Result<Self> {
        options.config.validate()?;
        options.config.pq.validate_for(options.dimensions)?;
        let IndexOptions {
            id,
            dimensions,
            config,
            store,
            storage,
        } = options;

        let commit_log = match &storage {
            Some(storage) => Some(CommitLog::open(storage.clone(), &id)?),
            None => None,
        };
        let (commit_log, events) = match commit_log {
            Some((log, events)) => (Some(log), events),
            None => (None, Vec::new()),
        };

        let dimensions = Arc::new(AtomicUsize::new(dimensions));
        let backend = build_backend(
            &config,
            store.clone(),
            dimensions.clone(),
            None,
            INITIAL_CAPACITY,
        );
        let index = Self {
            dimensions,
            metric: config.distance,
            backend: RwLock::new(backend),
            graph: Graph::new(),
            rng: Mutex::new(StdRng::seed_from_u64(config.seed)),
            level_multiplier: 1.0 / (config.max_connections.max(2) as f64).ln(),
            config: RwLock::new(config),
            id,
            store,
            storage,
            commit_log,
            paused: AtomicBool::new(false),
            shut: AtomicBool::new(false),
            compressing: AtomicBool::new(false),
            rebuild_pending: AtomicBool::new(false),
        };

        if !events.is_empty() {
            index.replay(events)?;
        }

        index.compress_in_background(&Context::background());

        info!(
            index = %index.id,
            nodes = index.graph.len(),
            tombstones = index.graph.tombstone_count(),
            compressed = index.backend().is_compressed(),
            "hnsw index opened"
        );
        Ok(index)
    }

    fn replay(&self, events: Vec<LogEvent>) -> Result<()> {
        let _maintenance = self.graph.maintenance_write();
        let mut quantizer: Option<ProductQuantizer> = None;
        let count = events.len();

        for event in events {
            match event {
                LogEvent::AddNode { id, level } => {
                    self.graph.remove_node(id);
                    self.graph.insert_node(Arc::new(Node::new(id, level)));
                }
                LogEvent::SetLinks { id, level, links } => {
                    self.replayed_node(id, level).write().set(level, links);
                }
                LogEvent::AddLink { id, level, target } => {
                    let node = self.replayed_node(id, level);
                    let mut adjacency = node.write();
                    if !adjacency.at(level).contains(&target) {
                        let mut links = adjacency.at(level).to_vec();
                        links.push(target);
                        adjacency.set(level, links);
                    }
                }
                LogEvent::AddTombstone { id } => {
                    self.graph.add_tombstone(id);
                }
                LogEvent::RemoveTombstone { id } => {
                    self.graph.remove_tombstone(id);
                }
                LogEvent::SetEntrypoint { id, level } => {
                    self.graph.set_entrypoint(Some(Entrypoint { id, level }));
                }
                LogEvent::DeleteNode { id } => {
                    self.graph.remove_node(id);
                }
                LogEvent::ResetIndex => {
                    self.graph.reset();
                    quantizer = None;
                }
                LogEvent::AddProductQuantizer { quantizer: trained } => {
                    quantizer = Some(trained);
                }
            }
        }

        let stale = self
            .graph
            .entrypoint()
            .is_some_and(|ep| !self.graph.contains(ep.id));
        if stale || (self.graph.entrypoint().is_none() && self.graph.len() > 0) {
            let replacement = self.highest_node(|_| true);
            warn!(
                index = %self.id,
                entrypoint = ?replacement.map(|e| e.id),
                "replayed entrypoint was missing, picked a new one"
            );
            self.graph.set_entrypoint(replacement);
        }

        if let Some(quantizer) = quantizer {
            if self.dimensions.load(Ordering::Acquire) == 0 {
                self.dimensions
                    .store(quantizer.dimensions(), Ordering::Release);
            }
            let config = {
                let mut config = self.config.write();
                if !config.pq.enabled {
                    warn!(index = %self.id, "commit log holds a quantizer, enabling pq");
                    config.pq.enabled = true;
                }
                config.clone()
            };
            let backend = build_backend(
                &config,
                self.store.clone(),
                self.dimensions.clone(),
                Some(Arc::new(quantizer)),
                self.graph.capacity().max(INITIAL_CAPACITY),
            );
            *self.backend.write() = backend;
        } else {
            self.backend().grow(self.graph.capacity());
        }

        info!(index = %self.id, events = count, nodes = self.graph.len(), "commit log replayed");
        Ok(())
    }

    /// The node a replayed link event refers to, created if an earlier
    /// record for it was lost.
    fn replayed_node(&self, id: u64, level: usize) -> Arc<Node> {
        if let Some(node) = self.graph.node(id) {
            return node;
        }
        let node = Arc::new(Node::new(id, level));
        self.graph.insert_node(node.clone());
        node
    }

    /// The live node with the highest level, lowest ID first on ties.
    /// Caller holds the maintenance lock.
    pub(super) fn highest_node<F: Fn(u64) -> bool>(&self, keep: F) -> Option<Entrypoint> {
        self.graph
            .nodes()
            .into_iter()
            .filter(|node| keep(node.id))
            .map(|node| Entrypoint {
                id: node.id,
                level: node.level(),
            })
            .max_by(|a, b| a.level.cmp(&b.level).then(b.id.cmp(&a.id)))
    }

    /// Identifier of this index.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Vector length, or zero before the first vector was added.
    pub fn dimensions(&self) -> usize {
        self.dimensions.load(Ordering::Acquire)
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> UserConfig {
        self.config.read().clone()
    }

    pub(super) fn backend(&self) -> Arc<dyn VectorBackend> {
        self.backend.read().clone()
    }

    /// Copy of the per-layer neighbor lists of `id`, tombstoned or not.
    pub fn links(&self, id: u64) -> Option<Vec<Vec<u64>>> {
        let _maintenance = self.graph.maintenance_read();
        let node = self.graph.node(id)?;
        let connections = node.read().connections.clone();
        Some(connections)
    }

    /// Whether `id` is in the graph and not deleted.
    pub fn contains(&self, id: u64) -> bool {
        self.graph.contains(id) && !self.graph.is_tombstoned(id)
    }

    /// Number of live (not deleted) nodes.
    pub fn len(&self) -> usize {
        self.graph
            .len()
            .saturating_sub(self.graph.tombstone_count())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(super) fn ensure_open(&self) -> Result<()> {
        if self.shut.load(Ordering::Acquire) {
            return Err(QuiverError::invalid_operation(format!(
                "index {} is shut down",
                self.id
            )));
        }
        Ok(())
    }

    pub(super) fn log(&self, event: &LogEvent) -> Result<()> {
        match &self.commit_log {
            Some(log) => log.append(event),
            None => Ok(()),
        }
    }

    /// Validate a caller vector and bring it into stored form.
    pub(super) fn prepare_vector(&self, vector: &[f32]) -> Result<Vec<f32>> {
        if vector.is_empty() {
            return Err(QuiverError::invalid_input("vector is empty"));
        }
        let dimensions = self.dimensions();
        if dimensions != 0 && vector.len() != dimensions {
            return Err(QuiverError::invalid_input(format!(
                "vector has {} dimensions, index {} expects {dimensions}",
                vector.len(),
                self.id
            )));
        }
        let mut prepared = vector.to_vec();
        self.metric.provider().prepare(&mut prepared);
        Ok(prepared)
    }

    /// Tombstone a node whose vector turned out to be missing.
    pub(super) fn heal(&self, id: u64) -> Result<()> {
        if self.graph.contains(id) && self.graph.add_tombstone(id) {
            warn!(index = %self.id, id, "vector missing from store, node tombstoned");
            self.log(&LogEvent::AddTombstone { id })?;
        }
        Ok(())
    }

    /// Apply a new configuration.
    ///
    /// Immutable fields are rejected. Switching between a bounded and an
    /// unbounded vector cache rebuilds the backend, and enabling product
    /// quantization compresses the index. Both are deferred until
    /// [`resume_maintenance`](Self::resume_maintenance) while maintenance is
    /// paused.
    pub fn update_user_config(&self, ctx: &Context, next: UserConfig) -> Result<()> {
        self.ensure_open()?;
        let current = self.config();
        current.validate_update(&next)?;
        next.pq.validate_for(self.dimensions())?;

        let rebuild = current.cache_is_bounded() != next.cache_is_bounded()
            || current.pq.rescore != next.pq.rescore;
        let compress = next.pq.enabled && !self.backend().is_compressed();
        {
            let _maintenance = self.graph.maintenance_write();
            *self.config.write() = next.clone();
            let pending = rebuild || self.rebuild_pending.load(Ordering::Acquire);
            if pending && self.is_paused() {
                self.rebuild_pending.store(true, Ordering::Release);
                debug!(index = %self.id, "maintenance paused, cache rebuild deferred");
            } else if pending {
                self.rebuild_backend(&next);
            } else {
                self.backend().update_max_size(next.vector_cache_max_objects);
            }
        }

        debug!(index = %self.id, config = ?next, "user config updated");
        if compress {
            self.maybe_compress(ctx)?;
        }
        Ok(())
    }

    /// Replace the backend with one built for `config`, keeping the
    /// quantizer. Caller holds the exclusive maintenance lock.
    fn rebuild_backend(&self, config: &UserConfig) {
        let backend = self.backend();
        let replacement = build_backend(
            config,
            self.store.clone(),
            self.dimensions.clone(),
            backend.quantizer(),
            self.graph.capacity().max(INITIAL_CAPACITY),
        );
        *self.backend.write() = replacement;
        backend.drain();
        self.rebuild_pending.store(false, Ordering::Release);
        info!(
            index = %self.id,
            bounded = config.cache_is_bounded(),
            "vector cache rebuilt"
        );
    }

    /// Compress once product quantization is enabled and the graph holds
    /// enough nodes to train every centroid. Concurrent callers and paused
    /// maintenance skip.
    pub(super) fn maybe_compress(&self, ctx: &Context) -> Result<()> {
        let (enabled, centroids) = {
            let config = self.config.read();
            (config.pq.enabled, config.pq.centroids)
        };
        if !enabled || self.is_paused() || self.backend().is_compressed() {
            return Ok(());
        }
        if self.len() < centroids {
            return Ok(());
        }
        if self.compressing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.compress_unless_paused(ctx);
        self.compressing.store(false, Ordering::Release);
        result.map(|_| ())
    }

    /// Lazy compression on behalf of an operation that already succeeded.
    /// A failure is logged and retried by the next caller.
    pub(super) fn compress_in_background(&self, ctx: &Context) {
        if let Err(e) = self.maybe_compress(ctx) {
            warn!(index = %self.id, error = %e, "compression failed, will retry");
        }
    }

    /// Train a product quantizer over a sample of the indexed vectors and
    /// switch to the compressed backend. Fails with `InvalidOperation` while
    /// maintenance is paused.
    pub fn compress(&self, ctx: &Context) -> Result<()> {
        if self.compress_unless_paused(ctx)? {
            Ok(())
        } else {
            Err(QuiverError::invalid_operation(format!(
                "index {} cannot be compressed while maintenance is paused",
                self.id
            )))
        }
    }

    /// Returns false without switching when maintenance is paused.
    fn compress_unless_paused(&self, ctx: &Context) -> Result<bool> {
        self.ensure_open()?;
        if self.backend().is_compressed() {
            return Ok(true);
        }
        if self.is_paused() {
            return Ok(false);
        }
        let config = self.config();
        let dimensions = self.dimensions();
        if dimensions == 0 {
            return Err(QuiverError::invalid_operation(
                "cannot compress an index without vectors",
            ));
        }

        // Training runs without the maintenance lock; rayon may otherwise
        // schedule an insert on this thread while it waits.
        let training = self.training_sample(ctx, &config)?;
        let quantizer = Arc::new(
            ProductQuantizer::fit(&config.pq, dimensions, self.metric, &training)
                .context_with(|| format!("compress index {}", self.id))?,
        );

        let _maintenance = self.graph.maintenance_write();
        let previous = self.backend();
        if previous.is_compressed() {
            return Ok(true);
        }
        if self.is_paused() {
            debug!(index = %self.id, "maintenance paused, compression deferred");
            return Ok(false);
        }
        let compressed = build_backend(
            &config,
            self.store.clone(),
            self.dimensions.clone(),
            Some(quantizer.clone()),
            self.graph.capacity().max(INITIAL_CAPACITY),
        );

        let mut encoded = 0usize;
        for node in self.graph.nodes() {
            if self.graph.is_tombstoned(node.id) {
                continue;
            }
            ctx.check("compress")?;
            match previous.vector(ctx, node.id)? {
                Some(vector) => {
                    compressed.preload(node.id, &vector)?;
                    encoded += 1;
                }
                None => self.heal(node.id)?,
            }
        }

        *self.backend.write() = compressed;
        previous.drain();
        self.config.write().pq.enabled = true;
        self.log(&LogEvent::AddProductQuantizer {
            quantizer: (*quantizer).clone(),
        })?;

        info!(
            index = %self.id,
            segments = quantizer.segments(),
            centroids = quantizer.centroids(),
            training = training.len(),
            encoded,
            "index compressed"
        );
        Ok(true)
    }

    fn training_sample(&self, ctx: &Context, config: &UserConfig) -> Result<Vec<Vec<f32>>> {
        let _maintenance = self.graph.maintenance_read();
        let backend = self.backend();
        let live: Vec<u64> = self
            .graph
            .nodes()
            .iter()
            .map(|node| node.id)
            .filter(|id| !self.graph.is_tombstoned(*id))
            .collect();

        let amount = live.len().min(config.pq.training_limit);
        let mut rng = StdRng::seed_from_u64(config.pq.seed);
        let mut training = Vec::with_capacity(amount);
        for idx in sample(&mut rng, live.len(), amount) {
            ctx.check("collect training vectors")?;
            let id = live[idx];
            match backend.vector(ctx, id)? {
                Some(vector) => training.push(vector),
                None => self.heal(id)?,
            }
        }
        Ok(training)
    }

    /// Load the vector of every live node into the cache.
    pub fn prefill_cache(&self, ctx: &Context) -> Result<usize> {
        self.ensure_open()?;
        let _maintenance = self.graph.maintenance_read();
        let backend = self.backend();
        let mut loaded = 0usize;
        for node in self.graph.nodes() {
            if self.graph.is_tombstoned(node.id) {
                continue;
            }
            ctx.check("prefill cache")?;
            if backend.prefetch(ctx, node.id)? {
                loaded += 1;
            } else {
                self.heal(node.id)?;
            }
        }
        info!(index = %self.id, loaded, "vector cache prefilled");
        Ok(loaded)
    }

    /// Flush the commit log to durable storage.
    pub fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        if let Some(log) = &self.commit_log {
            log.flush()?;
        }
        if let Some(storage) = &self.storage {
            storage.sync()?;
        }
        Ok(())
    }

    /// Wait for running operations, flush and release resources. Every
    /// later call fails with `InvalidOperation`.
    pub fn shutdown(&self) -> Result<()> {
        if self.shut.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _maintenance = self.graph.maintenance_write();
        if let Some(log) = &self.commit_log {
            log.flush()?;
            log.close()?;
        }
        if let Some(storage) = &self.storage {
            storage.sync()?;
        }
        self.backend().drain();
        info!(index = %self.id, "hnsw index shut down");
        Ok(())
    }

    /// Stop maintenance (tombstone cleanup, log compaction, compression and
    /// cache rebuilds), waiting for a running pass to finish.
    pub fn pause_maintenance(&self) {
        self.paused.store(true, Ordering::Release);
        drop(self.graph.maintenance_write());
        debug!(index = %self.id, "maintenance paused");
    }

    /// Resume maintenance and carry out a cache rebuild or compression that
    /// was requested while paused.
    pub fn resume_maintenance(&self) {
        self.paused.store(false, Ordering::Release);
        debug!(index = %self.id, "maintenance resumed");
        if self.shut.load(Ordering::Acquire) {
            return;
        }
        if self.rebuild_pending.load(Ordering::Acquire) {
            let _maintenance = self.graph.maintenance_write();
            if self.rebuild_pending.load(Ordering::Acquire) {
                let config = self.config();
                self.rebuild_backend(&config);
            }
        }
        self.compress_in_background(&Context::background());
    }

    pub(super) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Files in storage that belong to this index.
    pub fn list_files(&self) -> Result<Vec<String>> {
        let Some(storage) = &self.storage else {
            return Ok(Vec::new());
        };
        let prefix = format!("{}.", self.id);
        let mut files: Vec<String> = storage
            .list_files()?
            .into_iter()
            .filter(|name| name.starts_with(&prefix))
            .collect();
        files.sort();
        Ok(files)
    }

    /// Rewrite the commit log as the shortest event sequence describing the
    /// current graph. Returns false when skipped because maintenance is paused.
    pub fn compact_commit_log(&self) -> Result<bool> {
        self.ensure_open()?;
        let Some(log) = &self.commit_log else {
            return Ok(false);
        };
        if self.is_paused() {
            debug!(index = %self.id, "maintenance paused, compaction skipped");
            return Ok(false);
        }

        let _maintenance = self.graph.maintenance_write();
        let before = log.size()?;
        let mut events = Vec::new();
        if let Some(quantizer) = self.backend().quantizer() {
            events.push(LogEvent::AddProductQuantizer {
                quantizer: (*quantizer).clone(),
            });
        }

        let mut nodes = self.graph.nodes();
        nodes.sort_by_key(|node| node.id);
        for node in &nodes {
            let adjacency = node.read().clone();
            events.push(LogEvent::AddNode {
                id: node.id,
                level: adjacency.level,
            });
            for (level, links) in adjacency.connections.into_iter().enumerate() {
                if !links.is_empty() {
                    events.push(LogEvent::SetLinks {
                        id: node.id,
                        level,
                        links,
                    });
                }
            }
        }

        let mut tombstones: Vec<u64> = self
            .graph
            .tombstones()
            .into_iter()
            .filter(|id| self.graph.contains(*id))
            .collect();
        tombstones.sort_unstable();
        events.extend(tombstones.into_iter().map(|id| LogEvent::AddTombstone { id }));

        if let Some(ep) = self.graph.entrypoint() {
            events.push(LogEvent::SetEntrypoint {
                id: ep.id,
                level: ep.level,
            });
        }

        log.rewrite(&events)?;
        info!(
            index = %self.id,
            before,
            after = log.size()?,
            events = events.len(),
            "commit log compacted"
        );
        Ok(true)
    }

    /// Point-in-time counters.
    pub fn stats(&self) -> Result<IndexStats> {
        let commit_log_bytes = match &self.commit_log {
            Some(log) => log.size()?,
            None => 0,
        };
        let backend = self.backend();
        let entrypoint = self.graph.entrypoint();
        Ok(IndexStats {
            nodes: self.graph.len(),
            tombstones: self.graph.tombstone_count(),
            max_level: entrypoint.map_or(0, |ep| ep.level),
            entrypoint: entrypoint.map(|ep| ep.id),
            dimensions: self.dimensions(),
            cache_len: backend.cache_len(),
            compressed: backend.is_compressed(),
            commit_log_bytes,
        })
    }
}
