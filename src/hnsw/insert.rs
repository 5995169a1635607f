//! Insertion: level assignment, neighbor selection and back-edge repair.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use rand::Rng;
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::config::{MAX_NODE_ID, UserConfig};
use crate::context::Context;
use crate::error::{QuiverError, Result};
use crate::hnsw::backend::{QueryDistancer, VectorBackend};
use crate::hnsw::candidates::Candidate;
use crate::hnsw::commit_log::LogEvent;
use crate::hnsw::graph::{Entrypoint, MAX_LEVEL, Node};
use crate::hnsw::heuristic::select_neighbors;
use crate::hnsw::index::HnswIndex;

/// Neighbor lists chosen for a new node, one per layer from 0 up to the
/// lower of its level and the entrypoint level.
struct LinkPlan {
    layers: Vec<Vec<u64>>,
    /// No other node could be resolved; the node starts unconnected.
    orphan: bool,
}

impl HnswIndex {
    /// Insert node `id` with `vector`.
    ///
    /// Fails with `InvalidInput` for an empty vector, a dimension mismatch,
    /// an ID above [`MAX_NODE_ID`] or an ID already in the graph. A failed
    /// or cancelled add leaves the graph as it was.
    pub fn add(&self, ctx: &Context, id: u64, vector: &[f32]) -> Result<()> {
        self.ensure_open()?;
        ctx.check("add")?;
        if id > MAX_NODE_ID {
            return Err(QuiverError::invalid_input(format!(
                "node id {id} exceeds the maximum {MAX_NODE_ID}"
            )));
        }
        let vector = self.prepare_vector(vector)?;
        self.claim_dimensions(vector.len())?;
        if self.graph.contains(id) {
            return Err(duplicate(id));
        }
        let level = self.random_level();

        loop {
            let maintenance = self.graph.maintenance_read();
            let backend = self.backend();

            let Some(entrypoint) = self.graph.entrypoint() else {
                // The first node becomes the entrypoint; that needs the
                // exclusive lock, and another insert may win the race.
                drop(maintenance);
                let _exclusive = self.graph.maintenance_write();
                if self.graph.entrypoint().is_some() {
                    continue;
                }
                self.insert_first(id, level, &vector)?;
                return Ok(());
            };

            let plan = self.plan_links(ctx, backend.as_ref(), level, &vector, entrypoint)?;
            self.publish(backend.as_ref(), id, level, &vector, &plan)?;
            drop(maintenance);

            if level > entrypoint.level || plan.orphan {
                self.promote_entrypoint(id, level, plan.orphan)?;
            }
            self.compress_in_background(ctx);
            return Ok(());
        }
    }

    /// Insert many nodes in parallel. Stops at the first error.
    pub fn add_batch(&self, ctx: &Context, items: &[(u64, Vec<f32>)]) -> Result<()> {
        items
            .par_iter()
            .try_for_each(|(id, vector)| self.add(ctx, *id, vector))?;
        debug!(index = %self.id, count = items.len(), "batch added");
        Ok(())
    }

    fn claim_dimensions(&self, dimensions: usize) -> Result<()> {
        if self.dimensions() == 0 {
            self.config
                .read()
                .pq
                .validate_for(dimensions)
                .map_err(|e| QuiverError::invalid_input(e.to_string()))?;
        }
        match self
            .dimensions
            .compare_exchange(0, dimensions, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(current) if current == dimensions => Ok(()),
            Err(current) => Err(QuiverError::invalid_input(format!(
                "vector has {dimensions} dimensions, index {} expects {current}",
                self.id
            ))),
        }
    }

    /// `floor(-ln(U) * mL)` with `mL = 1 / ln(M)`, capped at [`MAX_LEVEL`].
    fn random_level(&self) -> usize {
        let uniform: f64 = self.rng.lock().random();
        let level = (-(1.0 - uniform).ln() * self.level_multiplier).floor();
        (level as usize).min(MAX_LEVEL)
    }

    /// Caller holds the exclusive maintenance lock.
    fn insert_first(&self, id: u64, level: usize, vector: &[f32]) -> Result<()> {
        let backend = self.backend();
        let node = Arc::new(Node::new(id, level));
        if !self.graph.insert_node(node) {
            return Err(duplicate(id));
        }
        let attached = (|| {
            backend.grow(id as usize + 1);
            backend.preload(id, vector)?;
            self.log(&LogEvent::AddNode { id, level })?;
            self.graph.set_entrypoint(Some(Entrypoint { id, level }));
            self.log(&LogEvent::SetEntrypoint { id, level })
        })();
        if let Err(e) = attached {
            self.graph.set_entrypoint(None);
            self.detach(backend.as_ref(), id);
            return Err(e);
        }
        debug!(index = %self.id, id, level, "first node inserted");
        Ok(())
    }

    /// Search the neighborhood of a new node and select its neighbors on
    /// every layer it shares with the entrypoint. Nothing is written, so a
    /// cancelled or failed plan leaves no trace. Caller holds the shared
    /// maintenance lock.
    fn plan_links(
        &self,
        ctx: &Context,
        backend: &dyn VectorBackend,
        level: usize,
        vector: &[f32],
        entrypoint: Entrypoint,
    ) -> Result<LinkPlan> {
        let shared = level.min(entrypoint.level);
        let mut plan = LinkPlan {
            layers: vec![Vec::new(); shared + 1],
            orphan: false,
        };

        let config = self.config();
        let mut distancer = backend.query_distancer(vector)?;
        let mut entry = match distancer.distance(ctx, entrypoint.id)? {
            Some(distance) => vec![Candidate::new(entrypoint.id, distance)],
            None => {
                self.heal(entrypoint.id)?;
                match self.any_live_node(ctx, distancer.as_mut())? {
                    Some(candidate) => vec![candidate],
                    None => {
                        plan.orphan = true;
                        return Ok(plan);
                    }
                }
            }
        };

        for layer in (level + 1..=entrypoint.level).rev() {
            ctx.check("add")?;
            let closest = self.search_layer(ctx, distancer.as_mut(), &entry, 1, layer, |_| true)?;
            if !closest.is_empty() {
                entry = closest;
            }
        }

        for layer in (0..=shared).rev() {
            ctx.check("add")?;
            let found = self.search_layer(
                ctx,
                distancer.as_mut(),
                &entry,
                config.ef_construction,
                layer,
                |_| true,
            )?;
            let selection = select_neighbors(
                ctx,
                backend,
                found.clone(),
                config.max_connections_at(layer),
                config.heuristic_alpha,
            )?;
            for missing in &selection.missing {
                self.heal(*missing)?;
            }
            plan.layers[layer] = selection.ids();
            if !found.is_empty() {
                entry = found;
            }
        }
        Ok(plan)
    }

    /// Put the node into the graph with its planned links, then add the
    /// back-edges. Until the first back-edge exists nothing points at the
    /// node, so a failure before that point is undone completely.
    fn publish(
        &self,
        backend: &dyn VectorBackend,
        id: u64,
        level: usize,
        vector: &[f32],
        plan: &LinkPlan,
    ) -> Result<()> {
        let node = Arc::new(Node::new(id, level));
        if !self.graph.insert_node(node.clone()) {
            return Err(duplicate(id));
        }
        if let Err(e) = self.attach(backend, &node, vector, plan) {
            self.detach(backend, id);
            return Err(e);
        }

        // The node is reachable from here on. Back-edges are best effort
        // and no longer observe the caller's deadline.
        let config = self.config();
        let background = Context::background();
        for (layer, neighbors) in plan.layers.iter().enumerate() {
            for &neighbor in neighbors {
                if let Err(e) = self.connect(&background, backend, neighbor, id, layer, &config) {
                    warn!(
                        index = %self.id,
                        id,
                        neighbor,
                        layer,
                        error = %e,
                        "back-edge not added"
                    );
                }
            }
        }
        Ok(())
    }

    fn attach(
        &self,
        backend: &dyn VectorBackend,
        node: &Node,
        vector: &[f32],
        plan: &LinkPlan,
    ) -> Result<()> {
        let id = node.id;
        backend.grow(id as usize + 1);
        backend.preload(id, vector)?;
        self.log(&LogEvent::AddNode {
            id,
            level: node.level(),
        })?;

        let mut adjacency = node.write();
        for (layer, links) in plan.layers.iter().enumerate() {
            adjacency.set(layer, links.clone());
            if !links.is_empty() {
                self.log(&LogEvent::SetLinks {
                    id,
                    level: layer,
                    links: links.clone(),
                })?;
            }
        }
        Ok(())
    }

    /// Remove a node nothing links to yet.
    fn detach(&self, backend: &dyn VectorBackend, id: u64) {
        self.graph.remove_node(id);
        backend.delete(id);
        if let Err(e) = self.log(&LogEvent::DeleteNode { id }) {
            warn!(index = %self.id, id, error = %e, "rollback of a failed add not logged");
        }
        debug!(index = %self.id, id, "failed add rolled back");
    }

    /// Add the back-edge `from -> to` at `layer`, re-selecting the
    /// neighbors of `from` when its list outgrows the bound. The node lock
    /// of `from` is held throughout, so concurrent back-edges to the same
    /// node are never lost.
    fn connect(
        &self,
        ctx: &Context,
        backend: &dyn VectorBackend,
        from: u64,
        to: u64,
        layer: usize,
        config: &UserConfig,
    ) -> Result<()> {
        let Some(node) = self.graph.node(from) else {
            return Ok(());
        };
        let max = config.max_connections_at(layer);

        let mut adjacency = node.write();
        if adjacency.level < layer || adjacency.at(layer).contains(&to) {
            return Ok(());
        }
        let mut links = adjacency.at(layer).to_vec();
        links.push(to);
        if links.len() <= max {
            adjacency.set(layer, links);
            return self.log(&LogEvent::AddLink {
                id: from,
                level: layer,
                target: to,
            });
        }

        let pruned = self.prune(ctx, backend, from, links, max, config.heuristic_alpha)?;
        adjacency.set(layer, pruned.clone());
        self.log(&LogEvent::SetLinks {
            id: from,
            level: layer,
            links: pruned,
        })
    }

    /// Shrink `links` of node `id` to at most `max` diverse neighbors.
    /// Takes no node lock.
    fn prune(
        &self,
        ctx: &Context,
        backend: &dyn VectorBackend,
        id: u64,
        mut links: Vec<u64>,
        max: usize,
        alpha: f32,
    ) -> Result<Vec<u64>> {
        let Some(mut distancer) = backend.node_distancer(ctx, id)? else {
            self.heal(id)?;
            links.truncate(max);
            return Ok(links);
        };

        let mut candidates = Vec::with_capacity(links.len());
        for link in links {
            match distancer.distance(ctx, link)? {
                Some(distance) => candidates.push(Candidate::new(link, distance)),
                None => self.heal(link)?,
            }
        }

        let selection = select_neighbors(ctx, backend, candidates, max, alpha)?;
        for missing in &selection.missing {
            self.heal(*missing)?;
        }
        Ok(selection.ids())
    }

    /// Any live node whose vector resolves. Used when the entrypoint itself
    /// turned out to be gone.
    fn any_live_node(
        &self,
        ctx: &Context,
        distancer: &mut dyn QueryDistancer,
    ) -> Result<Option<Candidate>> {
        for node in self.graph.nodes() {
            if self.graph.is_tombstoned(node.id) {
                continue;
            }
            match distancer.distance(ctx, node.id)? {
                Some(distance) => return Ok(Some(Candidate::new(node.id, distance))),
                None => self.heal(node.id)?,
            }
        }
        Ok(None)
    }

    /// Make `id` the entrypoint if it outranks the current one, or if
    /// `replace_dead` is set and the current one is tombstoned.
    fn promote_entrypoint(&self, id: u64, level: usize, replace_dead: bool) -> Result<()> {
        let _exclusive = self.graph.maintenance_write();
        if !self.graph.contains(id) {
            return Ok(());
        }
        if let Some(current) = self.graph.entrypoint() {
            let dead = replace_dead && self.graph.is_tombstoned(current.id);
            if current.level >= level && !dead {
                return Ok(());
            }
        }
        self.graph.set_entrypoint(Some(Entrypoint { id, level }));
        self.log(&LogEvent::SetEntrypoint { id, level })?;
        debug!(index = %self.id, id, level, "entrypoint promoted");
        Ok(())
    }
}

fn duplicate(id: u64) -> QuiverError {
    QuiverError::invalid_input(format!("node {id} already exists"))
}
