//! In-memory storage implementation for testing and ephemeral indexes.

use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::error::Result;
use crate::storage::{Storage, StorageError, StorageInput, StorageOutput};

type Files = Arc<Mutex<AHashMap<String, Vec<u8>>>>;

/// An in-memory storage implementation.
///
/// Writes go straight into the shared file map, so a reader opened after a
/// write sees it without an explicit flush.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    files: Files,
}

impl MemoryStorage {
    /// Create an empty memory storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of files stored.
    pub fn file_count(&self) -> usize {
        self.files.lock().len()
    }

    /// Get the total size of all files.
    pub fn total_size(&self) -> u64 {
        self.files.lock().values().map(|data| data.len() as u64).sum()
    }

    /// Overwrite the raw bytes of a file.
    pub fn put_bytes(&self, name: &str, data: Vec<u8>) {
        self.files.lock().insert(name.to_string(), data);
    }
}

impl Storage for MemoryStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let files = self.files.lock();
        let data = files
            .get(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;

        Ok(Box::new(MemoryInput {
            size: data.len() as u64,
            cursor: Cursor::new(data.clone()),
        }))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        self.files.lock().insert(name.to_string(), Vec::new());
        Ok(Box::new(MemoryOutput {
            name: name.to_string(),
            files: Arc::clone(&self.files),
            position: 0,
        }))
    }

    fn create_output_append(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        let position = self
            .files
            .lock()
            .entry(name.to_string())
            .or_default()
            .len() as u64;
        Ok(Box::new(MemoryOutput {
            name: name.to_string(),
            files: Arc::clone(&self.files),
            position,
        }))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.files.lock().contains_key(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.files.lock().remove(name);
        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let mut file_names: Vec<String> = self.files.lock().keys().cloned().collect();
        file_names.sort();
        Ok(file_names)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        let files = self.files.lock();
        let data = files
            .get(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;
        Ok(data.len() as u64)
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        let mut files = self.files.lock();
        let data = files
            .remove(old_name)
            .ok_or_else(|| StorageError::FileNotFound(old_name.to_string()))?;
        files.insert(new_name.to_string(), data);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// A memory-based input implementation.
#[derive(Debug)]
pub struct MemoryInput {
    cursor: Cursor<Vec<u8>>,
    size: u64,
}

impl Read for MemoryInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Seek for MemoryInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl StorageInput for MemoryInput {
    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }
}

/// A memory-based output implementation that appends to the shared map.
#[derive(Debug)]
pub struct MemoryOutput {
    name: String,
    files: Files,
    position: u64,
}

impl Write for MemoryOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.files
            .lock()
            .entry(self.name.clone())
            .or_default()
            .extend_from_slice(buf);
        self.position += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl StorageOutput for MemoryOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn position(&self) -> Result<u64> {
        Ok(self.position)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_is_visible_without_close() {
        let storage = MemoryStorage::new();
        let mut output = storage.create_output("a").unwrap();
        output.write_all(b"xyz").unwrap();

        assert_eq!(storage.file_size("a").unwrap(), 3);
        let mut input = storage.open_input("a").unwrap();
        let mut buffer = Vec::new();
        input.read_to_end(&mut buffer).unwrap();
        assert_eq!(buffer, b"xyz");
    }

    #[test]
    fn test_append_and_truncate() {
        let storage = MemoryStorage::new();
        storage.put_bytes("log", b"12".to_vec());

        let mut output = storage.create_output_append("log").unwrap();
        assert_eq!(output.position().unwrap(), 2);
        output.write_all(b"345").unwrap();
        assert_eq!(storage.file_size("log").unwrap(), 5);

        let _output = storage.create_output("log").unwrap();
        assert_eq!(storage.file_size("log").unwrap(), 0);
    }

    #[test]
    fn test_rename_delete_list() {
        let storage = MemoryStorage::new();
        storage.put_bytes("b", vec![1]);
        storage.put_bytes("a", vec![2, 3]);
        assert_eq!(storage.list_files().unwrap(), vec!["a", "b"]);
        assert_eq!(storage.total_size(), 3);

        storage.rename_file("a", "c").unwrap();
        assert!(storage.rename_file("a", "d").unwrap_err().is_not_found());
        storage.delete_file("b").unwrap();
        assert_eq!(storage.list_files().unwrap(), vec!["c"]);
        assert_eq!(storage.file_count(), 1);

        let (name, _out) = storage.create_temp_output("c").unwrap();
        assert_eq!(name, "c_0.tmp");
    }
}
