//! Error types for the Quiver library.
//!
//! All fallible operations return [`Result`], whose error type is the
//! [`QuiverError`] enum. The variants follow the failure taxonomy of the index:
//!
//! - [`QuiverError::NotFound`]: a vector or object no longer exists. Graph
//!   traversals recover from this locally by tombstoning the node.
//! - [`QuiverError::InvalidInput`]: the caller passed something unusable
//!   (empty query, dimension mismatch, invalid configuration).
//! - [`QuiverError::ResourceExhausted`]: the disk is full or an allocation failed.
//! - Everything else is treated as unrecoverable for the enclosing operation.
//!
//! # Examples
//!
//! ```
//! use quiver::error::{QuiverError, Result};
//!
//! fn lookup(id: u64) -> Result<Vec<f32>> {
//!     Err(QuiverError::not_found(format!("vector {id}")))
//! }
//!
//! let err = lookup(7).unwrap_err().with_context("search by id 7");
//! assert!(err.is_not_found());
//! ```

use std::io;

use thiserror::Error;

/// The main error type for Quiver operations.
#[derive(Error, Debug)]
pub enum QuiverError {
    /// I/O errors (file operations, network, etc.)
    #[error("I/O error: {0}")]
    Io(io::Error),

    /// The requested vector or object does not exist (anymore).
    #[error("Not found: {0}")]
    NotFound(String),

    /// The caller supplied invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource exhausted
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Operation cancelled
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Invalid operation
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// An error annotated with the operation that produced it.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<QuiverError>,
    },
}

/// Result type alias for operations that may fail with QuiverError.
pub type Result<T> = std::result::Result<T, QuiverError>;

impl From<io::Error> for QuiverError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::StorageFull | io::ErrorKind::OutOfMemory => {
                QuiverError::ResourceExhausted(err.to_string())
            }
            _ => QuiverError::Io(err),
        }
    }
}

impl From<bincode::Error> for QuiverError {
    fn from(err: bincode::Error) -> Self {
        QuiverError::Serialization(err.to_string())
    }
}

impl QuiverError {
    /// Create a new not found error.
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        QuiverError::NotFound(msg.into())
    }

    /// Create a new invalid input error.
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        QuiverError::InvalidInput(msg.into())
    }

    /// Create a new invalid config error.
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        QuiverError::InvalidInput(format!("invalid configuration: {}", msg.into()))
    }

    /// Create a new resource exhausted error.
    pub fn resource_exhausted<S: Into<String>>(msg: S) -> Self {
        QuiverError::ResourceExhausted(msg.into())
    }

    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        QuiverError::Storage(msg.into())
    }

    /// Create a new serialization error.
    pub fn serialization<S: Into<String>>(msg: S) -> Self {
        QuiverError::Serialization(msg.into())
    }

    /// Create a new cancelled error.
    pub fn cancelled<S: Into<String>>(msg: S) -> Self {
        QuiverError::Cancelled(msg.into())
    }

    /// Create a new invalid operation error.
    pub fn invalid_operation<S: Into<String>>(msg: S) -> Self {
        QuiverError::InvalidOperation(msg.into())
    }

    /// Wrap this error with a description of the operation that failed.
    pub fn with_context<S: Into<String>>(self, context: S) -> Self {
        QuiverError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping context layers.
    pub fn root(&self) -> &QuiverError {
        let mut current = self;
        while let QuiverError::Context { source, .. } = current {
            current = source;
        }
        current
    }

    /// Whether this error means the object or vector does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), QuiverError::NotFound(_))
    }

    /// Whether this error was caused by bad caller input.
    pub fn is_invalid_input(&self) -> bool {
        matches!(self.root(), QuiverError::InvalidInput(_))
    }

    /// Whether this error was caused by cancellation or an expired deadline.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), QuiverError::Cancelled(_))
    }
}

/// Extension for attaching context to results, keeping the error kind intact.
pub trait ResultExt<T> {
    /// Attach a lazily built context message to the error, if any.
    fn context_with<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context_with<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_construction() {
        let error = QuiverError::not_found("vector 3");
        assert_eq!(error.to_string(), "Not found: vector 3");

        let error = QuiverError::invalid_input("empty query vector");
        assert_eq!(error.to_string(), "Invalid input: empty query vector");

        let error = QuiverError::invalid_config("ef must be > 0");
        assert_eq!(
            error.to_string(),
            "Invalid input: invalid configuration: ef must be > 0"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        match QuiverError::from(io_error) {
            QuiverError::Io(_) => {}
            other => panic!("Expected IO error variant, got {other:?}"),
        }

        let full = io::Error::new(io::ErrorKind::StorageFull, "disk full");
        match QuiverError::from(full) {
            QuiverError::ResourceExhausted(_) => {}
            other => panic!("Expected resource exhausted, got {other:?}"),
        }
    }

    #[test]
    fn test_context_keeps_kind() {
        let err = QuiverError::not_found("vector 9")
            .with_context("fetch")
            .with_context("search by vector");
        assert!(err.is_not_found());
        assert!(!err.is_invalid_input());
        assert_eq!(
            err.to_string(),
            "search by vector: fetch: Not found: vector 9"
        );

        let res: Result<()> = Err(QuiverError::cancelled("deadline"));
        let err = res.context_with(|| "add 4").unwrap_err();
        assert!(err.is_cancelled());
    }
}
