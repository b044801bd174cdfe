//! Append-only event store backed by a JSONL file
//!
//! Each audit event is written as one JSON object per line. Lines are only
//! ever appended, never rewritten.

use crate::domain::{Event, NewEvent};
use crate::io::store::{EventStore, MonotonicClock, StoreError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

pub struct JsonlEventStore {
    file_path: PathBuf,
    clock: MonotonicClock,
    /// Serializes stamping and writing so file order matches timestamp order
    write_lock: Mutex<()>,
}

impl JsonlEventStore {
    pub fn new<P: AsRef<Path>>(file_path: P) -> Self {
        let file_path = file_path.as_ref().to_path_buf();
        info!(file_path = %file_path.display(), "event_log_initialized");
        Self { file_path, clock: MonotonicClock::new(), write_lock: Mutex::new(()) }
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    /// Append a line to the event file
    fn append_line(&self, line: &str) -> std::io::Result<()> {
        // Create parent directories if they don't exist
        if let Some(parent) = self.file_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&self.file_path)?;
        writeln!(file, "{}", line)?;
        debug!(file = %self.file_path.display(), bytes = %line.len(), "event_log_written");

        Ok(())
    }
}

#[async_trait]
impl EventStore for JsonlEventStore {
    async fn append_event(&self, event: NewEvent) -> Result<Event, StoreError> {
        let _guard = self.write_lock.lock();
        let event = event.stamp(Uuid::now_v7(), self.clock.now());
        let json = serde_json::to_string(&event)?;
        self.append_line(&json)?;
        Ok(event)
    }
}

/// Read every event from a JSONL event file, skipping blank lines
pub fn read_events<P: AsRef<Path>>(path: P) -> Result<Vec<Event>, StoreError> {
    let content = fs::read_to_string(path)?;
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(StoreError::from))
        .collect()
}
