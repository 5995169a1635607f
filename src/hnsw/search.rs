//! Multi-layer greedy search.

use ahash::AHashSet;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::allow_list::AllowList;
use crate::context::Context;
use crate::error::{QuiverError, Result, ResultExt};
use crate::hnsw::backend::{QueryDistancer, VectorBackend};
use crate::hnsw::candidates::{Candidate, CandidateQueue, ResultSet};
use crate::hnsw::index::HnswIndex;

/// How often the beam search looks at the context, in expanded candidates.
const CANCEL_CHECK_INTERVAL: usize = 64;

/// First page size of a distance-bounded search.
const DISTANCE_SEARCH_START: usize = 100;

/// IDs and distances, sorted ascending by distance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResults {
    pub ids: Vec<u64>,
    pub distances: Vec<f32>,
}

impl SearchResults {
    fn from_candidates(candidates: Vec<Candidate>) -> Self {
        let (ids, distances) = candidates.into_iter().map(|c| (c.id, c.distance)).unzip();
        Self { ids, distances }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// `(id, distance)` pairs, closest first.
    pub fn iter(&self) -> impl Iterator<Item = (u64, f32)> + '_ {
        self.ids.iter().copied().zip(self.distances.iter().copied())
    }
}

impl HnswIndex {
    /// The `k` nearest live nodes to `vector`, restricted to `allow_list`
    /// when given.
    pub fn search_by_vector(
        &self,
        ctx: &Context,
        vector: &[f32],
        k: usize,
        allow_list: Option<&AllowList>,
    ) -> Result<SearchResults> {
        self.ensure_open()?;
        let query = self.prepare_vector(vector)?;
        if k == 0 {
            return Ok(SearchResults::default());
        }

        let config = self.config();
        let ef = config.search_ef(k);
        let _maintenance = self.graph.maintenance_read();
        let backend = self.backend();

        let candidates = match allow_list {
            Some(list) if list.len() < config.flat_search_cutoff => {
                self.flat_search(ctx, backend.as_ref(), &query, ef, list)?
            }
            _ => self.knn_search(ctx, backend.as_ref(), &query, ef, allow_list)?,
        };

        let rescored = backend
            .rescore(ctx, &query, candidates)
            .context_with(|| format!("rescore results of index {}", self.id))?;
        for id in rescored.missing {
            self.heal(id)?;
        }

        let mut candidates = rescored.candidates;
        candidates.truncate(k);
        Ok(SearchResults::from_candidates(candidates))
    }

    /// The `k` nearest live nodes to the vector of node `id`.
    pub fn search_by_id(
        &self,
        ctx: &Context,
        id: u64,
        k: usize,
        allow_list: Option<&AllowList>,
    ) -> Result<SearchResults> {
        self.ensure_open()?;
        if !self.graph.contains(id) {
            return Err(QuiverError::not_found(format!(
                "node {id} in index {}",
                self.id
            )));
        }

        let vector = {
            let _maintenance = self.graph.maintenance_read();
            self.backend().vector(ctx, id)?
        };
        let Some(vector) = vector else {
            self.heal(id)?;
            return Err(QuiverError::not_found(format!(
                "vector of node {id} in index {}",
                self.id
            )));
        };
        self.search_by_vector(ctx, &vector, k, allow_list)
    }

    /// Every live node within `max_distance` of `vector`, up to
    /// `max_results` when given.
    ///
    /// Runs k-nearest searches with a growing `k` until a result falls
    /// outside the radius or the graph is exhausted.
    pub fn search_by_vector_distance(
        &self,
        ctx: &Context,
        vector: &[f32],
        max_distance: f32,
        max_results: Option<usize>,
        allow_list: Option<&AllowList>,
    ) -> Result<SearchResults> {
        let mut limit = match max_results {
            Some(max) => max.min(DISTANCE_SEARCH_START),
            None => DISTANCE_SEARCH_START,
        };
        if limit == 0 {
            self.ensure_open()?;
            self.prepare_vector(vector)?;
            return Ok(SearchResults::default());
        }

        loop {
            let mut results = self.search_by_vector(ctx, vector, limit, allow_list)?;
            let within = results
                .distances
                .iter()
                .take_while(|d| **d <= max_distance)
                .count();
            let exhausted = results.len() < limit;
            let enough = max_results.is_some_and(|max| within >= max);

            if within < results.len() || exhausted || enough {
                let keep = max_results.map_or(within, |max| within.min(max));
                results.ids.truncate(keep);
                results.distances.truncate(keep);
                return Ok(results);
            }

            limit = limit.saturating_mul(2);
            if let Some(max) = max_results {
                limit = limit.min(max);
            }
            debug!(index = %self.id, limit, "widening distance search");
        }
    }

    /// Greedy descent through the upper layers, then an `ef`-wide beam
    /// search on layer 0. Caller holds the maintenance lock.
    fn knn_search(
        &self,
        ctx: &Context,
        backend: &dyn VectorBackend,
        query: &[f32],
        ef: usize,
        allow_list: Option<&AllowList>,
    ) -> Result<Vec<Candidate>> {
        let Some(entrypoint) = self.graph.entrypoint() else {
            return Ok(Vec::new());
        };
        let mut distancer = backend.query_distancer(query)?;

        let Some(distance) = distancer.distance(ctx, entrypoint.id)? else {
            self.heal(entrypoint.id)?;
            return Err(QuiverError::not_found(format!(
                "entrypoint {} of index {}",
                entrypoint.id, self.id
            )));
        };

        let mut entry = vec![Candidate::new(entrypoint.id, distance)];
        for layer in (1..=entrypoint.level).rev() {
            ctx.check("search")?;
            let closest = self.search_layer(ctx, distancer.as_mut(), &entry, 1, layer, |_| true)?;
            if !closest.is_empty() {
                entry = closest;
            }
        }

        ctx.check("search")?;
        self.search_layer(ctx, distancer.as_mut(), &entry, ef, 0, |id| {
            !self.graph.is_tombstoned(id) && allow_list.is_none_or(|list| list.contains(id))
        })
    }

    /// Exhaustive scan over the members of a small allow-list.
    fn flat_search(
        &self,
        ctx: &Context,
        backend: &dyn VectorBackend,
        query: &[f32],
        ef: usize,
        allow_list: &AllowList,
    ) -> Result<Vec<Candidate>> {
        let mut distancer = backend.query_distancer(query)?;
        let mut results = ResultSet::new(ef);
        for (scanned, id) in allow_list.iter().enumerate() {
            if scanned % CANCEL_CHECK_INTERVAL == 0 {
                ctx.check("flat search")?;
            }
            if !self.graph.contains(id) || self.graph.is_tombstoned(id) {
                continue;
            }
            match distancer.distance(ctx, id)? {
                Some(distance) => results.push(Candidate::new(id, distance)),
                None => self.heal(id)?,
            }
        }
        Ok(results.into_sorted_vec())
    }

    /// Beam search over one layer.
    ///
    /// Every reachable node is traversed, but only nodes passing `admit`
    /// enter the result set. Nodes whose vectors are gone are tombstoned
    /// and skipped. Caller holds the maintenance lock and no node lock.
    pub(super) fn search_layer<F>(
        &self,
        ctx: &Context,
        distancer: &mut dyn QueryDistancer,
        entry: &[Candidate],
        ef: usize,
        layer: usize,
        admit: F,
    ) -> Result<Vec<Candidate>>
    where
        F: Fn(u64) -> bool,
    {
        let mut visited = AHashSet::with_capacity(ef * 8);
        let mut candidates = CandidateQueue::new();
        let mut results = ResultSet::new(ef);

        for &candidate in entry {
            if visited.insert(candidate.id) {
                candidates.push(candidate);
                if admit(candidate.id) {
                    results.push(candidate);
                }
            }
        }

        let mut expanded = 0usize;
        while let Some(current) = candidates.pop() {
            if results.is_full() && results.worst().is_some_and(|worst| current.distance > worst) {
                break;
            }
            expanded += 1;
            if expanded % CANCEL_CHECK_INTERVAL == 0 {
                ctx.check("search layer")?;
            }

            let Some(node) = self.graph.node(current.id) else {
                continue;
            };
            let neighbors = node.neighbors(layer);

            for neighbor in neighbors {
                if !visited.insert(neighbor) {
                    continue;
                }
                let Some(distance) = distancer.distance(ctx, neighbor)? else {
                    self.heal(neighbor)?;
                    continue;
                };
                if !results.accepts(distance) {
                    continue;
                }
                let candidate = Candidate::new(neighbor, distance);
                candidates.push(candidate);
                if admit(neighbor) {
                    results.push(candidate);
                }
            }
        }

        Ok(results.into_sorted_vec())
    }
}
