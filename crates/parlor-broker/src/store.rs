//! Append-only per-room logs on disk.
//!
//! One `<room>.jsonl` file per room under the data directory; each line is
//! one record and its line position is the post's index. Appends are the
//! only write path, so a record's index never changes once assigned.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One line of a room log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Broker receive time in ms.
    pub server_time: i64,
    /// Originator's claimed time in ms.
    pub client_time: i64,
    /// Originator-chosen opaque name.
    pub name: String,
    /// Opaque application payload.
    pub data: serde_json::Value,
}

/// Errors from room-log operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Room names are restricted to a safe filename alphabet.
    #[error("invalid room name {0:?}")]
    InvalidRoom(String),

    /// I/O error reading or writing a log file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A log line failed to encode or decode.
    #[error("log record error: {0}")]
    Json(#[from] serde_json::Error),
}

/// All room logs under one data directory.
#[derive(Debug)]
pub struct RoomStore {
    dir: PathBuf,
    /// Cached log lengths, filled lazily per room.
    lengths: HashMap<String, u64>,
}

impl RoomStore {
    /// Opens (and creates if needed) the data directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            lengths: HashMap::new(),
        })
    }

    /// Appends a record to a room log and returns its index.
    pub fn append(&mut self, room: &str, record: &LogRecord) -> Result<u64, StoreError> {
        let index = self.len(room)?;
        let path = self.room_path(room)?;
        let line = serde_json::to_string(record)?;

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(file, "{line}")?;

        self.lengths.insert(room.to_string(), index + 1);
        Ok(index)
    }

    /// Number of records in a room log; 0 for a room never posted to.
    pub fn len(&mut self, room: &str) -> Result<u64, StoreError> {
        if let Some(&len) = self.lengths.get(room) {
            return Ok(len);
        }
        let path = self.room_path(room)?;
        let len = match std::fs::read_to_string(&path) {
            Ok(contents) => contents.lines().count() as u64,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => 0,
            Err(err) => return Err(err.into()),
        };
        self.lengths.insert(room.to_string(), len);
        Ok(len)
    }

    /// Reads records from index `from` onward, with their indices.
    pub fn read_from(&self, room: &str, from: u64) -> Result<Vec<(u64, LogRecord)>, StoreError> {
        let path = self.room_path(room)?;
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut out = Vec::new();
        for (index, line) in contents.lines().enumerate() {
            if (index as u64) < from {
                continue;
            }
            let record: LogRecord = serde_json::from_str(line)?;
            out.push((index as u64, record));
        }
        Ok(out)
    }

    fn room_path(&self, room: &str) -> Result<PathBuf, StoreError> {
        if !valid_room_name(room) {
            return Err(StoreError::InvalidRoom(room.to_string()));
        }
        Ok(self.dir.join(format!("{room}.jsonl")))
    }
}

/// 1–64 chars of `[A-Za-z0-9_-]`; keeps room names safe as filenames.
pub fn valid_room_name(room: &str) -> bool {
    !room.is_empty()
        && room.len() <= 64
        && room
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
