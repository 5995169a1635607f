//! Node arena, entrypoint and tombstones.
//!
//! # Lock hierarchy
//!
//! 1. `maintenance`: read for search and insert traversal, write for
//!    entrypoint replacement, level promotion, backend switch and cleanup.
//! 2. One node lock at a time, always taken while holding `maintenance`.
//!
//! Leaf locks (the arena vector, the entrypoint cell and the tombstone set)
//! are held only for the duration of a copy and never while acquiring
//! another lock. Debug builds assert the hierarchy per thread.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use ahash::AHashSet;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::MAX_NODE_ID;

/// Hard cap on node levels.
pub const MAX_LEVEL: usize = 16;

#[cfg(debug_assertions)]
mod lock_order {
    use std::cell::Cell;

    thread_local! {
        static MAINTENANCE: Cell<bool> = const { Cell::new(false) };
        static NODE: Cell<Option<u64>> = const { Cell::new(None) };
    }

    pub fn maintenance_acquire() {
        MAINTENANCE.with(|held| {
            assert!(!held.get(), "maintenance lock taken twice on one thread");
            held.set(true);
        });
    }

    pub fn maintenance_release() {
        MAINTENANCE.with(|held| held.set(false));
    }

    pub fn node_acquire(id: u64) {
        MAINTENANCE.with(|held| {
            assert!(held.get(), "node {id} locked without the maintenance lock");
        });
        NODE.with(|node| {
            if let Some(other) = node.get() {
                panic!("node {id} locked while node {other} is still locked");
            }
            node.set(Some(id));
        });
    }

    pub fn node_release() {
        NODE.with(|node| node.set(None));
    }
}

#[cfg(not(debug_assertions))]
mod lock_order {
    #[inline(always)]
    pub fn maintenance_acquire() {}
    #[inline(always)]
    pub fn maintenance_release() {}
    #[inline(always)]
    pub fn node_acquire(_id: u64) {}
    #[inline(always)]
    pub fn node_release() {}
}

/// Guard over the maintenance lock.
pub(crate) struct MaintenanceGuard<G> {
    _inner: G,
}

impl<G> MaintenanceGuard<G> {
    fn new(inner: G) -> Self {
        lock_order::maintenance_acquire();
        Self { _inner: inner }
    }
}

impl<G> Drop for MaintenanceGuard<G> {
    fn drop(&mut self) {
        lock_order::maintenance_release();
    }
}

pub(crate) type MaintenanceRead<'a> = MaintenanceGuard<RwLockReadGuard<'a, ()>>;
pub(crate) type MaintenanceWrite<'a> = MaintenanceGuard<RwLockWriteGuard<'a, ()>>;

/// Guard over one node's adjacency.
pub(crate) struct NodeGuard<G> {
    inner: G,
}

impl<G> Drop for NodeGuard<G> {
    fn drop(&mut self) {
        lock_order::node_release();
    }
}

impl<G: Deref<Target = Adjacency>> Deref for NodeGuard<G> {
    type Target = Adjacency;

    fn deref(&self) -> &Adjacency {
        &self.inner
    }
}

impl<G: DerefMut<Target = Adjacency>> DerefMut for NodeGuard<G> {
    fn deref_mut(&mut self) -> &mut Adjacency {
        &mut self.inner
    }
}

/// Per-layer neighbor lists of one node.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Adjacency {
    pub level: usize,
    pub connections: Vec<Vec<u64>>,
}

impl Adjacency {
    /// Neighbors at `layer`, empty above the node's level.
    pub fn at(&self, layer: usize) -> &[u64] {
        self.connections.get(layer).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Replace the neighbors at `layer`, growing the level if needed.
    pub fn set(&mut self, layer: usize, links: Vec<u64>) {
        if layer >= self.connections.len() {
            self.connections.resize_with(layer + 1, Vec::new);
            self.level = self.level.max(layer);
        }
        self.connections[layer] = links;
    }
}

/// A graph node.
#[derive(Debug)]
pub(crate) struct Node {
    pub id: u64,
    adjacency: RwLock<Adjacency>,
}

impl Node {
    pub fn new(id: u64, level: usize) -> Self {
        Self {
            id,
            adjacency: RwLock::new(Adjacency {
                level,
                connections: vec![Vec::new(); level + 1],
            }),
        }
    }

    pub fn read(&self) -> NodeGuard<RwLockReadGuard<'_, Adjacency>> {
        lock_order::node_acquire(self.id);
        NodeGuard {
            inner: self.adjacency.read(),
        }
    }

    pub fn write(&self) -> NodeGuard<RwLockWriteGuard<'_, Adjacency>> {
        lock_order::node_acquire(self.id);
        NodeGuard {
            inner: self.adjacency.write(),
        }
    }

    /// The node's level.
    pub fn level(&self) -> usize {
        self.read().level
    }

    /// Copy of the neighbors at `layer`.
    pub fn neighbors(&self, layer: usize) -> Vec<u64> {
        self.read().at(layer).to_vec()
    }
}

/// Entrypoint and current top layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Entrypoint {
    pub id: u64,
    pub level: usize,
}

/// The graph store.
#[derive(Debug, Default)]
pub(crate) struct Graph {
    maintenance: RwLock<()>,
    nodes: RwLock<Vec<Option<Arc<Node>>>>,
    count: AtomicUsize,
    entrypoint: Mutex<Option<Entrypoint>>,
    tombstones: RwLock<AHashSet<u64>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn maintenance_read(&self) -> MaintenanceRead<'_> {
        MaintenanceGuard::new(self.maintenance.read())
    }

    pub fn maintenance_write(&self) -> MaintenanceWrite<'_> {
        MaintenanceGuard::new(self.maintenance.write())
    }

    pub fn node(&self, id: u64) -> Option<Arc<Node>> {
        self.nodes.read().get(id as usize).and_then(Clone::clone)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.nodes
            .read()
            .get(id as usize)
            .is_some_and(Option::is_some)
    }

    /// Put a node into the arena, growing it if needed. Returns false if the
    /// slot was already taken or the ID is above [`MAX_NODE_ID`].
    pub fn insert_node(&self, node: Arc<Node>) -> bool {
        if node.id > MAX_NODE_ID {
            return false;
        }
        let idx = node.id as usize;
        let mut nodes = self.nodes.write();
        if idx >= nodes.len() {
            let grow_to = (idx + 1).next_power_of_two().max(nodes.len() * 2).max(64);
            nodes.resize(grow_to, None);
        }
        if nodes[idx].is_some() {
            return false;
        }
        nodes[idx] = Some(node);
        self.count.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn remove_node(&self, id: u64) -> Option<Arc<Node>> {
        let removed = self
            .nodes
            .write()
            .get_mut(id as usize)
            .and_then(Option::take);
        if removed.is_some() {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Snapshot of every node in the arena.
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.read().iter().flatten().cloned().collect()
    }

    /// Number of slots in the arena (one past the highest addressable ID).
    pub fn capacity(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn entrypoint(&self) -> Option<Entrypoint> {
        *self.entrypoint.lock()
    }

    pub fn set_entrypoint(&self, entrypoint: Option<Entrypoint>) {
        *self.entrypoint.lock() = entrypoint;
    }

    pub fn is_tombstoned(&self, id: u64) -> bool {
        self.tombstones.read().contains(&id)
    }

    /// Returns true if the tombstone is new.
    pub fn add_tombstone(&self, id: u64) -> bool {
        self.tombstones.write().insert(id)
    }

    pub fn remove_tombstone(&self, id: u64) -> bool {
        self.tombstones.write().remove(&id)
    }

    pub fn tombstones(&self) -> AHashSet<u64> {
        self.tombstones.read().clone()
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.read().len()
    }

    /// Drop every node, tombstone and the entrypoint.
    pub fn reset(&self) {
        self.nodes.write().clear();
        self.count.store(0, Ordering::Relaxed);
        self.tombstones.write().clear();
        self.set_entrypoint(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_grows_and_removes() {
        let graph = Graph::new();
        assert!(graph.insert_node(Arc::new(Node::new(1000, 2))));
        assert!(!graph.insert_node(Arc::new(Node::new(1000, 0))));
        assert!(graph.capacity() > 1000);
        assert_eq!(graph.len(), 1);
        assert!(graph.contains(1000));
        assert!(!graph.contains(999));

        assert!(!graph.insert_node(Arc::new(Node::new(1 << 60, 0))));
        assert!(graph.capacity() < 1 << 20);

        assert!(graph.remove_node(1000).is_some());
        assert!(graph.remove_node(1000).is_none());
        assert_eq!(graph.len(), 0);
    }

    #[test]
    fn test_adjacency_under_maintenance() {
        let graph = Graph::new();
        graph.insert_node(Arc::new(Node::new(0, 1)));
        let _guard = graph.maintenance_read();
        let node = graph.node(0).unwrap();
        {
            let mut adjacency = node.write();
            adjacency.set(0, vec![1, 2]);
            adjacency.set(3, vec![4]);
        }
        assert_eq!(node.level(), 3);
        assert_eq!(node.neighbors(0), vec![1, 2]);
        assert!(node.neighbors(2).is_empty());
        assert!(node.read().at(7).is_empty());
    }

    #[test]
    fn test_tombstones_and_entrypoint() {
        let graph = Graph::new();
        assert!(graph.add_tombstone(3));
        assert!(!graph.add_tombstone(3));
        assert!(graph.is_tombstoned(3));
        assert_eq!(graph.tombstone_count(), 1);
        assert!(graph.remove_tombstone(3));

        graph.set_entrypoint(Some(Entrypoint { id: 3, level: 2 }));
        assert_eq!(graph.entrypoint().map(|e| e.id), Some(3));
        graph.reset();
        assert!(graph.entrypoint().is_none());
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "without the maintenance lock")]
    fn test_node_lock_requires_maintenance() {
        let node = Node::new(0, 0);
        let _guard = node.read();
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "still locked")]
    fn test_two_node_locks_panic() {
        let graph = Graph::new();
        graph.insert_node(Arc::new(Node::new(0, 0)));
        graph.insert_node(Arc::new(Node::new(1, 0)));
        let _maintenance = graph.maintenance_read();
        let a = graph.node(0).unwrap();
        let b = graph.node(1).unwrap();
        let _ga = a.read();
        let _gb = b.read();
    }
}
