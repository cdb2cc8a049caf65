//! Diagnostics collection for post-scenario analysis
//!
//! Records are kept in memory and, when a log path is configured, appended
//! to a buffered JSON-lines file. The buffer is flushed by
//! [`DiagnosticsCollector::flush`], when the path changes and on drop.
//! Recording may block briefly when a full buffer is written out.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use shared::{Payload, SharedResult};
use tracing::{debug, warn};

use crate::traits::DiagnosticsSink;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticEvent {
    pub category: String,
    pub status: String,
    pub details: Payload,
    pub timestamp: DateTime<Utc>,
}

struct LogFile {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl LogFile {
    fn new(path: PathBuf) -> Self {
        Self { path, writer: None }
    }

    fn append(&mut self, event: &DiagnosticEvent) -> SharedResult<()> {
        let line = serde_json::to_string(event)?;
        let writer = match self.writer.take() {
            Some(writer) => writer,
            None => {
                if let Some(parent) = self.path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                BufWriter::new(OpenOptions::new().create(true).append(true).open(&self.path)?)
            }
        };
        let writer = self.writer.insert(writer);
        writeln!(writer, "{line}")?;
        Ok(())
    }

    fn flush(&mut self) -> SharedResult<()> {
        if let Some(writer) = &mut self.writer {
            writer.flush()?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct DiagnosticsCollector {
    events: Mutex<Vec<DiagnosticEvent>>,
    log: Mutex<Option<LogFile>>,
    verbose: bool,
}

impl DiagnosticsCollector {
    pub fn new(verbose: bool, log_path: Option<PathBuf>) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            log: Mutex::new(log_path.map(LogFile::new)),
            verbose,
        }
    }

    pub fn events(&self) -> Vec<DiagnosticEvent> {
        self.events.lock().clone()
    }

    pub fn events_by_category(&self, category: &str) -> Vec<DiagnosticEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.category == category)
            .cloned()
            .collect()
    }

    /// Whether any record carries the given status
    pub fn has_status(&self, status: &str) -> bool {
        self.events.lock().iter().any(|event| event.status == status)
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Write buffered lines through to the log file
    pub fn flush(&self) -> SharedResult<()> {
        match self.log.lock().as_mut() {
            Some(log) => log.flush(),
            None => Ok(()),
        }
    }

    pub fn set_log_path(&self, log_path: Option<PathBuf>) {
        let mut log = self.log.lock();
        if let Some(previous) = log.as_mut() {
            if let Err(e) = previous.flush() {
                warn!(path = %previous.path.display(), error = %e, "Failed to flush diagnostics log");
            }
        }
        *log = log_path.map(LogFile::new);
    }
}

impl DiagnosticsSink for DiagnosticsCollector {
    fn record(&self, category: &str, status: &str, details: Payload) {
        let event = DiagnosticEvent {
            category: category.to_string(),
            status: status.to_string(),
            details,
            timestamp: Utc::now(),
        };

        if self.verbose {
            debug!(category, status, details = ?event.details, "Diagnostic recorded");
        }

        if let Some(log) = self.log.lock().as_mut() {
            if let Err(e) = log.append(&event) {
                warn!(path = %log.path.display(), error = %e, "Failed to stream diagnostic event");
            }
        }

        self.events.lock().push(event);
    }
}

impl Drop for DiagnosticsCollector {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(error = %e, "Failed to flush diagnostics log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared::payload;

    #[test]
    fn test_records_and_filters_by_category() {
        let collector = DiagnosticsCollector::default();
        collector.record("monitor", "poll-error", payload([("error", json!("boom"))]));
        collector.record("mutagen", "timeout", Payload::new());
        collector.record("monitor", "watchdog-timeout", Payload::new());

        let monitor = collector.events_by_category("monitor");
        assert_eq!(monitor.len(), 2);
        assert_eq!(monitor[0].details["error"], "boom");
        assert!(collector.has_status("timeout"));

        collector.clear();
        assert!(collector.events().is_empty());
    }

    #[test]
    fn test_streams_json_lines_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("diagnostics.jsonl");
        let collector = DiagnosticsCollector::new(true, Some(path.clone()));

        collector.record("mutagen", "timeout", payload([("session_id", json!("s-1"))]));
        collector.record("mutagen", "error", Payload::new());
        collector.flush().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["status"], "timeout");
        assert_eq!(lines[0]["details"]["session_id"], "s-1");
    }

    #[test]
    fn test_write_failure_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened for appending
        let collector = DiagnosticsCollector::new(false, Some(dir.path().to_path_buf()));

        collector.record("monitor", "poll-error", Payload::new());
        assert_eq!(collector.events().len(), 1);

        collector.set_log_path(None);
        collector.record("monitor", "poll-error", Payload::new());
        assert_eq!(collector.events().len(), 2);
    }

    #[test]
    fn test_lines_are_buffered_until_flush_or_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diagnostics.jsonl");
        let collector = DiagnosticsCollector::new(false, Some(path.clone()));

        collector.record("monitor", "heartbeat", payload([("iteration", json!(1))]));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");

        collector.record("monitor", "heartbeat", payload([("iteration", json!(2))]));
        drop(collector);
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 2);
    }

    #[test]
    fn test_changing_path_flushes_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.jsonl");
        let second = dir.path().join("second.jsonl");
        let collector = DiagnosticsCollector::new(false, Some(first.clone()));

        collector.record("scenario", "teardown", Payload::new());
        collector.set_log_path(Some(second.clone()));
        collector.record("scenario", "teardown", Payload::new());
        collector.flush().unwrap();

        assert_eq!(std::fs::read_to_string(&first).unwrap().lines().count(), 1);
        assert_eq!(std::fs::read_to_string(&second).unwrap().lines().count(), 1);
    }

    #[test]
    fn test_write_failure_surfaces_as_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = LogFile::new(dir.path().to_path_buf());
        let event = DiagnosticEvent {
            category: "monitor".to_string(),
            status: "poll-error".to_string(),
            details: Payload::new(),
            timestamp: Utc::now(),
        };

        let err = log.append(&event).unwrap_err();
        assert!(matches!(err, shared::SharedError::IoError(_)));
    }
}
