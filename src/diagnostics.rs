//! Durable log of stall recoveries.
//!
//! Records are kept as a JSON array on local disk so they survive the restart the
//! watchdog is about to force. Writes go through a temp file in the same directory
//! and are renamed into place.

use super::errors::StorageError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use log::{debug, info, warn};

/// Oldest records are dropped beyond this many.
pub const DEFAULT_CAPACITY: usize = 50;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticRecord {
    pub timestamp: DateTime<Utc>,
    pub stalled_for_ms: u64,
    pub current_index: Option<usize>,
    pub current_item_id: Option<String>,
    pub item_count: usize,
    /// Identifies the board that stalled.
    pub client_id: String,
}

#[derive(Debug)]
pub struct DiagnosticLog {
    path: Option<PathBuf>,
    records: Vec<DiagnosticRecord>,
    capacity: usize,
}

impl DiagnosticLog {
    pub fn in_memory() -> Self {
        Self { path: None, records: Vec::new(), capacity: DEFAULT_CAPACITY }
    }

    /// Opens the log at `path`, loading any records already there. A missing or
    /// unreadable file starts an empty log.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<Vec<DiagnosticRecord>>(&text) {
                Ok(records) => {
                    info!("Loaded {} diagnostic record(s) from {}", records.len(), path.display());
                    records
                }
                Err(e) => {
                    warn!("Diagnostic log {} is corrupt, starting fresh: {}", path.display(), e);
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!("Cannot read diagnostic log {}: {}", path.display(), e);
                Vec::new()
            }
        };
        Self { path: Some(path), records, capacity: DEFAULT_CAPACITY }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn records(&self) -> &[DiagnosticRecord] {
        &self.records
    }

    /// Appends `record` and writes the log to disk. The record stays in memory even
    /// when the write fails.
    pub fn append(&mut self, record: DiagnosticRecord) -> Result<(), StorageError> {
        self.records.push(record);
        if self.records.len() > self.capacity {
            let excess = self.records.len() - self.capacity;
            self.records.drain(..excess);
        }
        match &self.path {
            Some(path) => persist(path, &self.records),
            None => Ok(()),
        }
    }
}

fn persist(path: &Path, records: &[DiagnosticRecord]) -> Result<(), StorageError> {
    let dir = path.parent().filter(|d| !d.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, records)?;
    tmp.flush()?;
    tmp.persist(path)?;
    debug!("Wrote {} diagnostic record(s) to {}", records.len(), path.display());
    Ok(())
}
