//! Bounded, lock-striped cache with approximate LRU eviction.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::cache::{CachedVector, Fetcher, VectorCache, entry};
use crate::context::Context;
use crate::error::Result;

struct Entry<T> {
    vector: CachedVector<T>,
    last_used: AtomicU64,
}

type Shard<T> = RwLock<AHashMap<u64, Entry<T>>>;

/// A bounded vector cache.
///
/// Entries are spread over `shards` maps by ID. Each hit stamps the entry
/// with a global logical clock. When the total count exceeds the budget the
/// oldest-stamped entries are removed shard by shard, taking one shard lock
/// at a time, until the cache is back under budget with some headroom.
pub struct ShardedCache<T> {
    shards: Box<[Shard<T>]>,
    max_size: AtomicUsize,
    count: AtomicUsize,
    clock: AtomicU64,
    evicting: Mutex<()>,
    fetcher: Fetcher<T>,
}

impl<T> fmt::Debug for ShardedCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardedCache")
            .field("shards", &self.shards.len())
            .field("max_size", &self.max_size.load(Ordering::Relaxed))
            .field("count", &self.count.load(Ordering::Relaxed))
            .finish()
    }
}

/// Default shard count: a few shards per core.
pub fn default_shard_count() -> usize {
    (num_cpus::get() * 4).next_power_of_two().max(16)
}

impl<T: Send + Sync + 'static> ShardedCache<T> {
    /// Create a cache holding at most about `max_size` vectors.
    pub fn new(max_size: usize, fetcher: Fetcher<T>) -> Self {
        Self::with_shards(max_size, default_shard_count(), fetcher)
    }

    /// Create a cache with an explicit shard count.
    pub fn with_shards(max_size: usize, shards: usize, fetcher: Fetcher<T>) -> Self {
        let shards = shards.max(1);
        Self {
            shards: (0..shards).map(|_| RwLock::new(AHashMap::new())).collect(),
            max_size: AtomicUsize::new(max_size.max(1)),
            count: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
            evicting: Mutex::new(()),
            fetcher,
        }
    }

    #[inline]
    fn shard(&self, id: u64) -> &Shard<T> {
        &self.shards[(id % self.shards.len() as u64) as usize]
    }

    #[inline]
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn insert(&self, id: u64, vector: CachedVector<T>, replace: bool) -> CachedVector<T> {
        let stamp = self.tick();
        let stored = {
            let mut shard = self.shard(id).write();
            match shard.get_mut(&id) {
                Some(existing) if !replace => {
                    existing.last_used.store(stamp, Ordering::Relaxed);
                    existing.vector.clone()
                }
                Some(existing) => {
                    existing.vector = vector.clone();
                    existing.last_used.store(stamp, Ordering::Relaxed);
                    vector
                }
                None => {
                    shard.insert(
                        id,
                        Entry {
                            vector: vector.clone(),
                            last_used: AtomicU64::new(stamp),
                        },
                    );
                    self.count.fetch_add(1, Ordering::Relaxed);
                    vector
                }
            }
        };
        self.evict_if_needed();
        stored
    }

    fn evict_if_needed(&self) {
        let max = self.max_size.load(Ordering::Relaxed);
        if self.count.load(Ordering::Relaxed) <= max {
            return;
        }
        // Another thread is already making room.
        let Some(_guard) = self.evicting.try_lock() else {
            return;
        };

        let count = self.count.load(Ordering::Relaxed);
        if count <= max {
            return;
        }
        let target = (count - max) + max / 8;
        let per_shard = target.div_ceil(self.shards.len()).max(1);

        let mut evicted = 0;
        let mut pass = 0;
        while evicted < target && pass < 2 {
            for shard in self.shards.iter() {
                if evicted >= target {
                    break;
                }
                let mut map = shard.write();
                let quota = per_shard.min(target - evicted).min(map.len());
                if quota == 0 {
                    continue;
                }
                let mut stamps: Vec<(u64, u64)> = map
                    .iter()
                    .map(|(id, e)| (e.last_used.load(Ordering::Relaxed), *id))
                    .collect();
                if quota < stamps.len() {
                    stamps.select_nth_unstable(quota - 1);
                }
                for (_, id) in stamps.into_iter().take(quota) {
                    if map.remove(&id).is_some() {
                        evicted += 1;
                    }
                }
            }
            pass += 1;
        }

        self.count.fetch_sub(evicted, Ordering::Relaxed);
        debug!(evicted, max, "vector cache eviction");
    }
}

impl<T: Send + Sync + 'static> VectorCache<T> for ShardedCache<T> {
    fn get(&self, ctx: &Context, id: u64) -> Result<CachedVector<T>> {
        if let Some(vector) = self.get_cached(id) {
            return Ok(vector);
        }

        // No shard lock is held while the store is consulted.
        let vector = entry((self.fetcher)(ctx, id)?);
        Ok(self.insert(id, vector, false))
    }

    fn get_cached(&self, id: u64) -> Option<CachedVector<T>> {
        let shard = self.shard(id).read();
        shard.get(&id).map(|e| {
            e.last_used.store(self.tick(), Ordering::Relaxed);
            e.vector.clone()
        })
    }

    fn preload(&self, id: u64, vector: CachedVector<T>) {
        self.insert(id, vector, true);
    }

    fn delete(&self, id: u64) {
        if self.shard(id).write().remove(&id).is_some() {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn grow(&self, _size: usize) {}

    fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    fn drain(&self) {
        for shard in self.shards.iter() {
            let mut map = shard.write();
            let removed = map.len();
            map.clear();
            self.count.fetch_sub(removed, Ordering::Relaxed);
        }
    }

    fn update_max_size(&self, size: usize) {
        self.max_size.store(size.max(1), Ordering::Relaxed);
        self.evict_if_needed();
    }

    fn max_size(&self) -> usize {
        self.max_size.load(Ordering::Relaxed)
    }
}
