//! The error side channel.
//!
//! Records that fail mapping, rows the destination refuses and post-load check
//! violations are appended here instead of aborting the load.

use crate::record::{ErrorEntry, Stage};
use anyhow::Result;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Append-only store of [`ErrorEntry`] values
pub trait ErrorLog: Send + Sync {
    fn append(&self, entry: ErrorEntry) -> Result<()>;

    /// Stamp `message` with the current time and append it
    fn record(&self, stage: Stage, message: String) -> Result<()> {
        self.append(ErrorEntry::new(stage, message))
    }
}

/// Error log shared between the operators of one run
pub type SharedErrorLog = Arc<dyn ErrorLog>;

/// Writes every entry as a `warn` event and keeps nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorLog;

impl ErrorLog for TracingErrorLog {
    fn append(&self, entry: ErrorEntry) -> Result<()> {
        warn!(stage = %entry.stage, at = %entry.at, "{}", entry.message);
        Ok(())
    }
}

/// Keeps entries in memory; handy for embedding and tests
#[derive(Debug, Default)]
pub struct MemoryErrorLog {
    entries: Mutex<Vec<ErrorEntry>>,
}

impl MemoryErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything appended so far
    pub fn entries(&self) -> Vec<ErrorEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ErrorLog for MemoryErrorLog {
    fn append(&self, entry: ErrorEntry) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_log_keeps_entries_in_order() {
        let log = MemoryErrorLog::new();
        log.record(Stage::Map, "first".into()).unwrap();
        log.record(Stage::Validate, "second".into()).unwrap();

        let entries = log.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "first");
        assert_eq!(entries[1].stage, Stage::Validate);
        assert!(entries[0].at <= entries[1].at);
    }

    #[test]
    fn shared_log_is_object_safe() {
        let log: SharedErrorLog = Arc::new(TracingErrorLog);
        log.record(Stage::Load, "constraint failed".into()).unwrap();
    }
}
