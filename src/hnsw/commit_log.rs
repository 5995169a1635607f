//! Append-only log of structural graph events.
//!
//! Every mutation of the graph is recorded as a [`LogEvent`] and replayed in
//! order on open. Records are framed as
//!
//! ```text
//! [payload length: u32 LE][crc32 of payload: u32 LE][bincode payload]
//! ```
//!
//! A crash can leave a partially written record at the end of the file.
//! Replay stops at the first record that is short or fails its checksum,
//! and the file is cut back to the last good record before new appends land
//! behind it.

use std::io::{Cursor, Read, Write};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{QuiverError, Result, ResultExt};
use crate::quantization::ProductQuantizer;
use crate::storage::{Storage, StorageOutput};

const HEADER_LEN: usize = 8;

/// One structural event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogEvent {
    /// A node was created with the given top level.
    AddNode { id: u64, level: usize },
    /// The adjacency of `id` at `level` was replaced.
    SetLinks { id: u64, level: usize, links: Vec<u64> },
    /// `target` was appended to the adjacency of `id` at `level`.
    AddLink { id: u64, level: usize, target: u64 },
    /// `id` was marked deleted.
    AddTombstone { id: u64 },
    /// The tombstone of `id` was cleared.
    RemoveTombstone { id: u64 },
    /// The entrypoint moved.
    SetEntrypoint { id: u64, level: usize },
    /// `id` was physically removed from the graph.
    DeleteNode { id: u64 },
    /// The whole graph was discarded.
    ResetIndex,
    /// The index switched to compressed vectors.
    AddProductQuantizer { quantizer: ProductQuantizer },
}

/// The commit log of one index.
#[derive(Debug)]
pub struct CommitLog {
    storage: Arc<dyn Storage>,
    file_name: String,
    writer: Mutex<Option<Box<dyn StorageOutput>>>,
}

/// Name of the commit log file of index `index_id`.
pub fn log_file_name(index_id: &str) -> String {
    format!("{index_id}.hnsw.commitlog")
}

fn encode_record(event: &LogEvent) -> Result<Vec<u8>> {
    let payload = bincode::serialize(event)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| QuiverError::serialization("commit log record exceeds 4 GiB"))?;

    let mut record = Vec::with_capacity(HEADER_LEN + payload.len());
    record.write_u32::<LittleEndian>(len)?;
    record.write_u32::<LittleEndian>(crc32fast::hash(&payload))?;
    record.extend_from_slice(&payload);
    Ok(record)
}

/// Decode records until the end of `bytes` or the first bad record.
///
/// Returns the events and the length of the valid prefix.
fn decode_records(bytes: &[u8]) -> (Vec<LogEvent>, usize) {
    let mut events = Vec::new();
    let mut cursor = Cursor::new(bytes);
    let mut valid = 0usize;

    loop {
        let remaining = bytes.len() - valid;
        if remaining == 0 {
            break;
        }
        if remaining < HEADER_LEN {
            warn!(offset = valid, remaining, "torn commit log header");
            break;
        }
        let (Ok(len), Ok(crc)) = (
            cursor.read_u32::<LittleEndian>(),
            cursor.read_u32::<LittleEndian>(),
        ) else {
            break;
        };
        let start = valid + HEADER_LEN;
        let end = start + len as usize;
        if end > bytes.len() {
            warn!(offset = valid, len, "torn commit log record");
            break;
        }
        let payload = &bytes[start..end];
        if crc32fast::hash(payload) != crc {
            warn!(offset = valid, "commit log record failed its checksum");
            break;
        }
        match bincode::deserialize::<LogEvent>(payload) {
            Ok(event) => events.push(event),
            Err(e) => {
                warn!(offset = valid, error = %e, "undecodable commit log record");
                break;
            }
        }
        cursor.set_position(end as u64);
        valid = end;
    }

    (events, valid)
}

impl CommitLog {
    /// Open the log of `index_id`, returning it with the events to replay.
    pub fn open(storage: Arc<dyn Storage>, index_id: &str) -> Result<(Self, Vec<LogEvent>)> {
        let log = Self {
            storage,
            file_name: log_file_name(index_id),
            writer: Mutex::new(None),
        };
        let events = log.recover()?;
        Ok((log, events))
    }

    /// File name of this log.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    fn recover(&self) -> Result<Vec<LogEvent>> {
        if !self.storage.file_exists(&self.file_name) {
            return Ok(Vec::new());
        }

        let mut bytes = Vec::new();
        self.storage
            .open_input(&self.file_name)?
            .read_to_end(&mut bytes)?;

        let (events, valid) = decode_records(&bytes);
        if valid < bytes.len() {
            warn!(
                file = %self.file_name,
                kept = valid,
                dropped = bytes.len() - valid,
                "truncating commit log to last complete record"
            );
            self.replace_contents(&bytes[..valid])?;
        }
        debug!(file = %self.file_name, events = events.len(), "commit log read");
        Ok(events)
    }

    fn replace_contents(&self, bytes: &[u8]) -> Result<()> {
        let (temp_name, mut output) = self.storage.create_temp_output(&self.file_name)?;
        output.write_all(bytes)?;
        output.close()?;
        self.storage.rename_file(&temp_name, &self.file_name)?;
        self.storage.sync()
    }

    /// Append one event.
    pub fn append(&self, event: &LogEvent) -> Result<()> {
        let record = encode_record(event)?;
        let mut writer = self.writer.lock();
        if writer.is_none() {
            *writer = Some(self.storage.create_output_append(&self.file_name)?);
        }
        if let Some(output) = writer.as_mut() {
            output
                .write_all(&record)
                .map_err(QuiverError::from)
                .context_with(|| format!("append to {}", self.file_name))?;
        }
        Ok(())
    }

    /// Flush buffered records and sync them to storage.
    pub fn flush(&self) -> Result<()> {
        if let Some(output) = self.writer.lock().as_mut() {
            output.flush_and_sync()?;
        }
        Ok(())
    }

    /// Replace the log with `events`, atomically.
    pub fn rewrite(&self, events: &[LogEvent]) -> Result<()> {
        let mut bytes = Vec::new();
        for event in events {
            bytes.extend_from_slice(&encode_record(event)?);
        }

        let mut writer = self.writer.lock();
        if let Some(mut output) = writer.take() {
            output.close()?;
        }
        self.replace_contents(&bytes)?;
        debug!(file = %self.file_name, events = events.len(), "commit log rewritten");
        Ok(())
    }

    /// Current size of the log file in bytes.
    pub fn size(&self) -> Result<u64> {
        if let Some(output) = self.writer.lock().as_mut() {
            output.flush()?;
        }
        if !self.storage.file_exists(&self.file_name) {
            return Ok(0);
        }
        self.storage.file_size(&self.file_name)
    }

    /// Flush and release the writer.
    pub fn close(&self) -> Result<()> {
        if let Some(mut output) = self.writer.lock().take() {
            output.close()?;
        }
        Ok(())
    }
}
