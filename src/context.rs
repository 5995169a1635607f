//! Cancellation and deadlines for index operations.
//!
//! Every search and insert takes a [`Context`]. The graph code checks it at
//! layer boundaries and periodically during the layer-0 beam search, so an
//! overdue query can be abandoned without leaving shared state half-mutated.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::{QuiverError, Result};

/// Cancellation signal plus an optional deadline.
#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context that expires after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// A context driven by an externally owned cancellation token.
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// A child context: cancelled when this one is, with an optional tighter deadline.
    pub fn child(&self, timeout: Option<Duration>) -> Self {
        let deadline = match (self.deadline, timeout) {
            (Some(parent), Some(t)) => Some(parent.min(Instant::now() + t)),
            (None, Some(t)) => Some(Instant::now() + t),
            (parent, None) => parent,
        };
        Self {
            token: self.token.child_token(),
            deadline,
        }
    }

    /// Cancel this context and all of its children.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the context was cancelled or its deadline has passed.
    pub fn is_done(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Return an error naming `operation` if the context is done.
    pub fn check(&self, operation: &str) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(QuiverError::cancelled(format!("{operation}: context cancelled")));
        }
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(QuiverError::cancelled(format!(
                "{operation}: deadline exceeded"
            )));
        }
        Ok(())
    }
}
