//! Hierarchical Navigable Small World graph index.
//!
//! [`HnswIndex`] ties together the node arena ([`graph`]), the vector
//! backends ([`backend`]), neighbor selection ([`heuristic`]) and the
//! [`commit_log`]. Operations are split by concern:
//!
//! - `insert`: `add`, `add_batch`
//! - `search`: `search_by_vector`, `search_by_id`, `search_by_vector_distance`
//! - `delete`: `delete`, `cleanup_tombstones`
//! - `index`: open/replay, configuration updates, compression and lifecycle

pub mod backend;
pub mod candidates;
pub mod commit_log;
mod delete;
mod graph;
mod heuristic;
mod index;
mod insert;
mod search;

pub use backend::{DiskBackend, InMemoryBackend, QueryDistancer, Rescored, VectorBackend};
pub use candidates::Candidate;
pub use commit_log::{CommitLog, LogEvent};
pub use graph::MAX_LEVEL;
pub use index::{HnswIndex, IndexOptions, IndexStats};
pub use search::SearchResults;
