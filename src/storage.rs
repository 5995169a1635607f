//! Storage abstraction for the index's on-disk artifacts.
//!
//! The graph itself lives in memory; what reaches storage is the commit log
//! that rebuilds it on open. File and memory backends can be swapped without
//! touching the index code.
//!
//! # Storage Types
//!
//! ## FileStorage
//! - Disk-based persistent storage rooted at one directory
//! - Buffered writes, optional sync on every write
//!
//! ## MemoryStorage
//! - In-memory storage for testing and ephemeral indexes
//!
//! # Example
//!
//! ```
//! use quiver::storage::Storage;
//! use quiver::storage::memory::MemoryStorage;
//! use std::io::{Read, Write};
//!
//! # fn main() -> quiver::error::Result<()> {
//! let storage = MemoryStorage::new();
//!
//! let mut output = storage.create_output("main.hnsw.commitlog")?;
//! output.write_all(b"records")?;
//! output.close()?;
//!
//! let mut input = storage.open_input("main.hnsw.commitlog")?;
//! let mut buffer = Vec::new();
//! input.read_to_end(&mut buffer)?;
//! assert_eq!(buffer, b"records");
//! # Ok(())
//! # }
//! ```

use std::io::{Read, Seek, Write};

use crate::error::{QuiverError, Result};

pub mod file;
pub mod memory;

/// A trait for storage backends that can store and retrieve files.
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Open an existing file for reading.
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>>;

    /// Create a file for writing, truncating any existing content.
    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>>;

    /// Open a file for appending, creating it if it does not exist.
    fn create_output_append(&self, name: &str) -> Result<Box<dyn StorageOutput>>;

    /// Check if a file exists.
    fn file_exists(&self, name: &str) -> bool;

    /// Delete a file. Deleting a missing file succeeds.
    fn delete_file(&self, name: &str) -> Result<()>;

    /// List all file names, sorted.
    fn list_files(&self) -> Result<Vec<String>>;

    /// Size of a file in bytes.
    fn file_size(&self, name: &str) -> Result<u64>;

    /// Atomically rename a file, replacing `new_name` if it exists.
    ///
    /// Used for atomic replacement: write to a temporary file, then rename
    /// it so readers never see partial data.
    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()>;

    /// Create a file with a unique name starting with `prefix`.
    fn create_temp_output(&self, prefix: &str) -> Result<(String, Box<dyn StorageOutput>)> {
        for counter in 0..10_000 {
            let temp_name = format!("{prefix}_{counter}.tmp");
            if !self.file_exists(&temp_name) {
                let output = self.create_output(&temp_name)?;
                return Ok((temp_name, output));
            }
        }
        Err(StorageError::IoError("Could not create temporary file".to_string()).into())
    }

    /// Sync all pending writes to the underlying medium.
    fn sync(&self) -> Result<()>;
}

/// A trait for reading data from storage.
pub trait StorageInput: Read + Seek + Send + std::fmt::Debug {
    /// Get the size of the input stream.
    fn size(&self) -> Result<u64>;
}

/// A trait for writing data to storage.
pub trait StorageOutput: Write + Send + std::fmt::Debug {
    /// Flush buffered bytes and sync them to the medium.
    fn flush_and_sync(&mut self) -> Result<()>;

    /// Number of bytes in the file after the buffered writes land.
    fn position(&self) -> Result<u64>;

    /// Flush, sync and close the output stream.
    fn close(&mut self) -> Result<()>;
}

/// Error types specific to storage operations.
#[derive(Debug, Clone)]
pub enum StorageError {
    /// File not found.
    FileNotFound(String),

    /// I/O error.
    IoError(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::FileNotFound(name) => write!(f, "File not found: {name}"),
            StorageError::IoError(msg) => write!(f, "I/O error: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<StorageError> for QuiverError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::FileNotFound(name) => {
                QuiverError::not_found(format!("file {name}"))
            }
            other => QuiverError::storage(other.to_string()),
        }
    }
}
