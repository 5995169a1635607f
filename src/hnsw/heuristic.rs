//! Diversity-preserving neighbor selection.
//!
//! Candidates are visited closest first. A candidate is accepted unless an
//! already accepted neighbor `p` dominates it:
//!
//! ```text
//! alpha * dist(candidate, p) < dist(candidate, base)
//! ```
//!
//! A candidate exactly as far from `p` as from the base is kept.
//!
//! With `alpha = 1` this is the heuristic from the HNSW paper. Larger values
//! reject fewer candidates and keep longer edges.

use crate::context::Context;
use crate::error::Result;
use crate::hnsw::backend::VectorBackend;
use crate::hnsw::candidates::Candidate;

/// Accepted neighbors plus candidates whose vectors turned out to be gone.
#[derive(Debug, Default)]
pub(crate) struct Selection {
    pub accepted: Vec<Candidate>,
    pub missing: Vec<u64>,
}

impl Selection {
    pub fn ids(&self) -> Vec<u64> {
        self.accepted.iter().map(|c| c.id).collect()
    }
}

/// Pick at most `max` diverse neighbors from `candidates`, whose distances
/// are measured from the node being linked.
pub(crate) fn select_neighbors(
    ctx: &Context,
    backend: &dyn VectorBackend,
    mut candidates: Vec<Candidate>,
    max: usize,
    alpha: f32,
) -> Result<Selection> {
    candidates.sort();
    candidates.dedup_by_key(|c| c.id);

    let mut selection = Selection::default();
    if candidates.len() <= max {
        selection.accepted = candidates;
        return Ok(selection);
    }

    for candidate in candidates {
        if selection.accepted.len() >= max {
            break;
        }
        let Some(mut distancer) = backend.node_distancer(ctx, candidate.id)? else {
            selection.missing.push(candidate.id);
            continue;
        };

        let mut dominated = false;
        for peer in &selection.accepted {
            match distancer.distance(ctx, peer.id)? {
                Some(to_peer) if alpha * to_peer < candidate.distance => {
                    dominated = true;
                    break;
                }
                Some(_) => {}
                None => selection.missing.push(peer.id),
            }
        }
        if !dominated {
            selection.accepted.push(candidate);
        }
    }

    Ok(selection)
}
