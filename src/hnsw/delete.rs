//! Tombstones and the cleanup pass that removes tombstoned nodes.
//!
//! `delete` only marks a node. Searches keep traversing it but never return
//! it. `cleanup_tombstones` later takes the exclusive maintenance lock,
//! re-links every node that pointed at a deleted one and drops the deleted
//! nodes from the graph and the vector cache.

use std::sync::Arc;

use ahash::AHashSet;
use tracing::{debug, info};

use crate::config::UserConfig;
use crate::context::Context;
use crate::error::Result;
use crate::hnsw::backend::{QueryDistancer, VectorBackend};
use crate::hnsw::candidates::Candidate;
use crate::hnsw::commit_log::LogEvent;
use crate::hnsw::graph::Node;
use crate::hnsw::heuristic::select_neighbors;
use crate::hnsw::index::HnswIndex;

impl HnswIndex {
    /// Mark `id` deleted. Unknown and already deleted IDs are a no-op.
    pub fn delete(&self, id: u64) -> Result<()> {
        self.ensure_open()?;
        let _maintenance = self.graph.maintenance_read();
        if !self.graph.contains(id) {
            debug!(index = %self.id, id, "delete of unknown node ignored");
            return Ok(());
        }
        if self.graph.add_tombstone(id) {
            self.log(&LogEvent::AddTombstone { id })?;
        }
        Ok(())
    }

    /// Physically remove every tombstoned node, repairing the edges that
    /// pointed at them. Returns the number of removed nodes; zero while
    /// maintenance is paused.
    pub fn cleanup_tombstones(&self, ctx: &Context) -> Result<usize> {
        self.ensure_open()?;
        if self.is_paused() {
            debug!(index = %self.id, "maintenance paused, cleanup skipped");
            return Ok(0);
        }

        let _exclusive = self.graph.maintenance_write();
        if self.is_paused() {
            return Ok(0);
        }
        let deleted = self.graph.tombstones();
        if deleted.is_empty() {
            return Ok(0);
        }
        let backend = self.backend();
        let config = self.config();
        debug!(index = %self.id, tombstones = deleted.len(), "tombstone cleanup started");

        let all_gone = self.replace_entrypoint(&deleted)?;

        let mut repaired = 0usize;
        if !all_gone {
            for node in self.graph.nodes() {
                if deleted.contains(&node.id) {
                    continue;
                }
                ctx.check("cleanup tombstones")?;
                if self.reassign_neighbors(ctx, backend.as_ref(), &node, &deleted, &config)? {
                    repaired += 1;
                }
            }
        }

        let mut removed = 0usize;
        let mut ids: Vec<u64> = deleted.into_iter().collect();
        ids.sort_unstable();
        for id in ids {
            if self.graph.remove_node(id).is_some() {
                self.log(&LogEvent::DeleteNode { id })?;
                removed += 1;
            }
            backend.delete(id);
            self.graph.remove_tombstone(id);
            self.log(&LogEvent::RemoveTombstone { id })?;
        }

        if all_gone && self.graph.len() == 0 {
            // Nothing left: start the log over, keeping a trained quantizer.
            self.graph.reset();
            self.log(&LogEvent::ResetIndex)?;
            if let Some(quantizer) = backend.quantizer() {
                self.log(&LogEvent::AddProductQuantizer {
                    quantizer: (*quantizer).clone(),
                })?;
            }
        }

        info!(
            index = %self.id,
            removed,
            repaired,
            remaining = self.graph.len(),
            "tombstone cleanup finished"
        );
        Ok(removed)
    }

    /// Move the entrypoint off a deleted node onto the live node with the
    /// highest level. Returns true when no live node is left.
    fn replace_entrypoint(&self, deleted: &AHashSet<u64>) -> Result<bool> {
        let Some(current) = self.graph.entrypoint() else {
            return Ok(self.highest_node(|id| !deleted.contains(&id)).is_none());
        };
        if !deleted.contains(&current.id) {
            return Ok(false);
        }

        match self.highest_node(|id| !deleted.contains(&id)) {
            Some(replacement) => {
                self.graph.set_entrypoint(Some(replacement));
                self.log(&LogEvent::SetEntrypoint {
                    id: replacement.id,
                    level: replacement.level,
                })?;
                debug!(
                    index = %self.id,
                    from = current.id,
                    to = replacement.id,
                    level = replacement.level,
                    "entrypoint replaced"
                );
                Ok(false)
            }
            None => {
                self.graph.set_entrypoint(None);
                Ok(true)
            }
        }
    }

    /// Replace every layer of `node` that links to a deleted node with a
    /// fresh selection from its surviving links and the links of the
    /// deleted nodes. Returns whether anything changed.
    fn reassign_neighbors(
        &self,
        ctx: &Context,
        backend: &dyn VectorBackend,
        node: &Arc<Node>,
        deleted: &AHashSet<u64>,
        config: &UserConfig,
    ) -> Result<bool> {
        let adjacency = node.read().clone();
        let mut changed = false;
        let mut distancer: Option<Box<dyn QueryDistancer + '_>> = None;

        for layer in 0..=adjacency.level {
            let links = adjacency.at(layer);
            if !links.iter().any(|link| deleted.contains(link)) {
                continue;
            }
            changed = true;

            let candidates = self.replacement_candidates(node.id, links, layer, deleted);
            if distancer.is_none() {
                distancer = backend.node_distancer(ctx, node.id)?;
            }
            let Some(distancer) = distancer.as_mut() else {
                // The node's own vector is gone; drop the dead edges and let
                // the next cleanup remove the node itself.
                self.heal(node.id)?;
                let survivors: Vec<u64> = links
                    .iter()
                    .copied()
                    .filter(|link| !deleted.contains(link))
                    .collect();
                self.write_links(node, layer, survivors)?;
                continue;
            };

            let mut scored = Vec::with_capacity(candidates.len());
            for candidate in candidates {
                match distancer.distance(ctx, candidate)? {
                    Some(distance) => scored.push(Candidate::new(candidate, distance)),
                    None => self.heal(candidate)?,
                }
            }
            let selection = select_neighbors(
                ctx,
                backend,
                scored,
                config.max_connections_at(layer),
                config.heuristic_alpha,
            )?;
            for missing in &selection.missing {
                self.heal(*missing)?;
            }
            self.write_links(node, layer, selection.ids())?;
        }
        Ok(changed)
    }

    /// Surviving links of `id` at `layer` plus everything reachable through
    /// chains of deleted nodes.
    fn replacement_candidates(
        &self,
        id: u64,
        links: &[u64],
        layer: usize,
        deleted: &AHashSet<u64>,
    ) -> Vec<u64> {
        let mut candidates = AHashSet::new();
        let mut visited = AHashSet::new();
        let mut pending: Vec<u64> = Vec::new();

        for &link in links {
            if deleted.contains(&link) {
                pending.push(link);
            } else {
                candidates.insert(link);
            }
        }

        while let Some(dead) = pending.pop() {
            if !visited.insert(dead) {
                continue;
            }
            let Some(dead_node) = self.graph.node(dead) else {
                continue;
            };
            for link in dead_node.neighbors(layer) {
                if link == id {
                    continue;
                }
                if deleted.contains(&link) {
                    pending.push(link);
                } else {
                    candidates.insert(link);
                }
            }
        }

        let mut candidates: Vec<u64> = candidates.into_iter().collect();
        candidates.sort_unstable();
        candidates
    }

    fn write_links(&self, node: &Node, layer: usize, links: Vec<u64>) -> Result<()> {
        let mut adjacency = node.write();
        adjacency.set(layer, links.clone());
        self.log(&LogEvent::SetLinks {
            id: node.id,
            level: layer,
            links,
        })
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::distance::DistanceMetric;
    use crate::store::VectorStore;
    use crate::hnsw::index::IndexOptions;
    use crate::store::MemoryVectorStore;

    fn build(count: u64) -> (HnswIndex, Arc<MemoryVectorStore>) {
        let store = Arc::new(MemoryVectorStore::new());
        let config = UserConfig::default()
            .with_distance(DistanceMetric::L2Squared)
            .with_max_connections(6)
            .with_ef_construction(48);
        let index =
            HnswIndex::open(IndexOptions::new("delete", 5, store.clone()).with_config(config))
                .unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let ctx = Context::background();
        for id in 0..count {
            let vector: Vec<f32> = (0..5).map(|_| rng.random::<f32>()).collect();
            store.put(id, vector.clone());
            index.add(&ctx, id, &vector).unwrap();
        }
        (index, store)
    }

    #[test]
    fn test_deleted_ids_never_returned() {
        let (index, store) = build(300);
        let ctx = Context::background();
        for id in (0..300).step_by(2) {
            index.delete(id).unwrap();
        }
        index.delete(10_000).unwrap();
        index.delete(4).unwrap();
        assert_eq!(index.len(), 150);

        for id in [0u64, 2, 100, 298] {
            let vector = store.vector_for_id(&ctx, id).unwrap();
            let results = index.search_by_vector(&ctx, &vector, 10, None).unwrap();
            assert_eq!(results.len(), 10);
            assert!(results.ids.iter().all(|id| id % 2 == 1));
        }
    }

    #[test]
    fn test_cleanup_removes_nodes_and_edges() {
        let (index, store) = build(300);
        let ctx = Context::background();
        for id in 0..100 {
            index.delete(id).unwrap();
        }
        assert_eq!(index.cleanup_tombstones(&ctx).unwrap(), 100);
        assert_eq!(index.stats().unwrap().tombstones, 0);
        assert_eq!(index.graph.len(), 200);

        {
            let _maintenance = index.graph.maintenance_read();
            let entrypoint = index.graph.entrypoint().unwrap();
            assert!(entrypoint.id >= 100);
            for node in index.graph.nodes() {
                let adjacency = node.read();
                for links in &adjacency.connections {
                    assert!(links.iter().all(|link| *link >= 100));
                }
            }
        }

        // Survivors are still found.
        for id in [100u64, 150, 299] {
            let vector = store.vector_for_id(&ctx, id).unwrap();
            let results = index.search_by_vector(&ctx, &vector, 1, None).unwrap();
            assert_eq!(results.ids, vec![id]);
        }
    }

    #[test]
    fn test_cleanup_of_everything_resets() {
        let (index, store) = build(40);
        let ctx = Context::background();
        for id in 0..40 {
            index.delete(id).unwrap();
        }
        assert_eq!(index.cleanup_tombstones(&ctx).unwrap(), 40);
        assert!(index.is_empty());
        assert!(index.stats().unwrap().entrypoint.is_none());

        store.put(7, vec![0.5; 5]);
        index.add(&ctx, 7, &[0.5; 5]).unwrap();
        let results = index.search_by_vector(&ctx, &[0.5; 5], 1, None).unwrap();
        assert_eq!(results.ids, vec![7]);
    }

    #[test]
    fn test_paused_cleanup_is_skipped() {
        let (index, _) = build(20);
        index.delete(3).unwrap();
        index.pause_maintenance();
        assert_eq!(index.cleanup_tombstones(&Context::background()).unwrap(), 0);
        assert_eq!(index.stats().unwrap().tombstones, 1);

        index.resume_maintenance();
        assert_eq!(index.cleanup_tombstones(&Context::background()).unwrap(), 1);
        assert!(!index.contains(3));
    }
}
