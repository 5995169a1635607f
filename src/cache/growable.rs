//! Lock-free growable array cache.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::RwLock;

use crate::cache::{CachedVector, Fetcher, VectorCache, entry};
use crate::config::{MAX_NODE_ID, UNBOUNDED_CACHE};
use crate::context::Context;
use crate::error::Result;

const MIN_CAPACITY: usize = 1024;

type Slots<T> = Vec<ArcSwapOption<Vec<T>>>;

/// An array of atomic vector pointers indexed by ID.
///
/// `get` is a single atomic load of the backing array followed by an atomic
/// load of the slot. `grow` builds a larger array, copies the slot pointers
/// and swaps it in; readers holding the old array keep a consistent view.
/// Slot writers take `resize` in read mode so that no write can land in an
/// array that is being copied.
pub struct GrowableCache<T> {
    slots: ArcSwap<Slots<T>>,
    resize: RwLock<()>,
    count: AtomicUsize,
    fetcher: Fetcher<T>,
}

impl<T> GrowableCache<T> {
    /// Number of addressable slots.
    pub fn capacity(&self) -> usize {
        self.slots.load().len()
    }
}

impl<T> fmt::Debug for GrowableCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrowableCache")
            .field("capacity", &self.capacity())
            .field("count", &self.count.load(Ordering::Relaxed))
            .finish()
    }
}

fn empty_slots<T>(capacity: usize) -> Slots<T> {
    (0..capacity).map(|_| ArcSwapOption::empty()).collect()
}

impl<T: Send + Sync + 'static> GrowableCache<T> {
    /// Create a cache with room for `initial_capacity` IDs.
    pub fn new(initial_capacity: usize, fetcher: Fetcher<T>) -> Self {
        Self {
            slots: ArcSwap::from_pointee(empty_slots(initial_capacity.max(MIN_CAPACITY))),
            resize: RwLock::new(()),
            count: AtomicUsize::new(0),
            fetcher,
        }
    }

    fn store(&self, id: u64, value: Option<CachedVector<T>>) {
        if id > MAX_NODE_ID {
            return;
        }
        let idx = id as usize;
        if value.is_some() && idx >= self.capacity() {
            self.grow(idx + 1);
        }

        let _guard = self.resize.read();
        let slots = self.slots.load();
        let Some(slot) = slots.get(idx) else {
            return;
        };

        let inserting = value.is_some();
        let previous = slot.swap(value);
        match (previous.is_some(), inserting) {
            (false, true) => {
                self.count.fetch_add(1, Ordering::Relaxed);
            }
            (true, false) => {
                self.count.fetch_sub(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }
}

impl<T: Send + Sync + 'static> VectorCache<T> for GrowableCache<T> {
    fn get(&self, ctx: &Context, id: u64) -> Result<CachedVector<T>> {
        if let Some(vector) = self.get_cached(id) {
            return Ok(vector);
        }

        let vector = entry((self.fetcher)(ctx, id)?);
        self.store(id, Some(vector.clone()));
        Ok(vector)
    }

    fn get_cached(&self, id: u64) -> Option<CachedVector<T>> {
        let slots = self.slots.load();
        slots.get(id as usize).and_then(|slot| slot.load_full())
    }

    fn preload(&self, id: u64, vector: CachedVector<T>) {
        self.store(id, Some(vector));
    }

    fn delete(&self, id: u64) {
        self.store(id, None);
    }

    fn grow(&self, size: usize) {
        let size = size.min((MAX_NODE_ID as usize).saturating_add(1));
        if size <= self.capacity() {
            return;
        }

        let _guard = self.resize.write();
        let current = self.slots.load_full();
        if size <= current.len() {
            return;
        }

        let new_capacity = size.next_power_of_two().max(current.len() * 2);
        let next: Slots<T> = (0..new_capacity)
            .map(|idx| match current.get(idx) {
                Some(slot) => ArcSwapOption::new(slot.load_full()),
                None => ArcSwapOption::empty(),
            })
            .collect();
        self.slots.store(Arc::new(next));
    }

    fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    fn drain(&self) {
        let _guard = self.resize.write();
        let capacity = self.capacity();
        self.slots.store(Arc::new(empty_slots(capacity)));
        self.count.store(0, Ordering::Relaxed);
    }

    fn update_max_size(&self, _size: usize) {}

    fn max_size(&self) -> usize {
        UNBOUNDED_CACHE
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    use super::*;
    use crate::error::QuiverError;

    fn counting_fetcher(calls: Arc<AtomicUsize>) -> Fetcher<f32> {
        Arc::new(move |_ctx, id| {
            calls.fetch_add(1, Ordering::SeqCst);
            if id == 13 {
                return Err(QuiverError::not_found(format!("object {id}")));
            }
            Ok(vec![id as f32; 4])
        })
    }

    #[test]
    fn test_miss_fetches_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = GrowableCache::new(4, counting_fetcher(calls.clone()));
        let ctx = Context::background();

        assert_eq!(*cache.get(&ctx, 5).unwrap(), vec![5.0; 4]);
        assert_eq!(*cache.get(&ctx, 5).unwrap(), vec![5.0; 4]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_not_found_is_not_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = GrowableCache::new(4, counting_fetcher(calls.clone()));
        let ctx = Context::background();

        assert!(cache.get(&ctx, 13).unwrap_err().is_not_found());
        assert!(cache.get_cached(13).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_preload_beyond_capacity_grows() {
        let cache = GrowableCache::new(0, counting_fetcher(Arc::new(AtomicUsize::new(0))));
        let initial = cache.capacity();
        cache.preload(initial as u64 + 10, Arc::new(vec![1.0]));
        assert!(cache.capacity() > initial + 10);
        assert_eq!(
            *cache.get_cached(initial as u64 + 10).unwrap(),
            vec![1.0]
        );

        cache.delete(initial as u64 + 10);
        assert!(cache.get_cached(initial as u64 + 10).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_ids_beyond_bound_are_not_cached() {
        let cache = GrowableCache::new(0, counting_fetcher(Arc::new(AtomicUsize::new(0))));
        let initial = cache.capacity();
        cache.preload(1 << 60, Arc::new(vec![1.0]));
        assert!(cache.get_cached(1 << 60).is_none());
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.capacity(), initial);
        assert!(initial <= MAX_NODE_ID as usize + 1);
    }

    #[test]
    fn test_debug_reports_capacity() {
        let cache = GrowableCache::new(0, counting_fetcher(Arc::new(AtomicUsize::new(0))));
        cache.preload(3, Arc::new(vec![1.0]));
        let rendered = format!("{cache:?}");
        assert!(rendered.contains(&format!("capacity: {}", cache.capacity())));
        assert!(rendered.contains("count: 1"));
    }

    #[test]
    fn test_concurrent_preload_and_grow() {
        let cache = Arc::new(GrowableCache::new(
            0,
            counting_fetcher(Arc::new(AtomicUsize::new(0))),
        ));
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let cache = cache.clone();
                thread::spawn(move || {
                    for i in 0..5000u64 {
                        let id = i * 4 + t;
                        cache.preload(id, Arc::new(vec![id as f32]));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.len(), 20_000);
        for id in 0..20_000u64 {
            assert_eq!(*cache.get_cached(id).unwrap(), vec![id as f32]);
        }
    }
}
