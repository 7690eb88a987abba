//! Run context
//!
//! Shared state of one pipeline run. Every stage writes its events here;
//! the buffer ends up in the run report. Events are also forwarded to
//! `tracing` so the console shows them as they happen.

use keel_core::domain::log::{LogEntry, LogLevel};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Execution context shared across stages and node tasks
pub struct RunContext {
    /// Run identifier, carried by every log line
    pub run_id: Uuid,

    log_buffer: Mutex<Vec<LogEntry>>,
}

impl RunContext {
    /// Creates a new run context
    pub fn new(run_id: Uuid) -> Arc<Self> {
        Arc::new(Self {
            run_id,
            log_buffer: Mutex::new(Vec::new()),
        })
    }

    /// Adds a log entry to the buffer
    pub fn add_log(&self, entry: LogEntry) {
        let mut buffer = self.log_buffer.lock().unwrap();
        buffer.push(entry);
    }

    fn record(&self, level: LogLevel, message: String) {
        self.add_log(LogEntry {
            timestamp: chrono::Utc::now(),
            level,
            message,
        });
    }

    pub fn log_debug(&self, message: String) {
        debug!(run_id = %self.run_id, "{}", message);
        self.record(LogLevel::Debug, message);
    }

    pub fn log_info(&self, message: String) {
        info!(run_id = %self.run_id, "{}", message);
        self.record(LogLevel::Info, message);
    }

    pub fn log_warning(&self, message: String) {
        warn!(run_id = %self.run_id, "{}", message);
        self.record(LogLevel::Warning, message);
    }

    pub fn log_error(&self, message: String) {
        error!(run_id = %self.run_id, "{}", message);
        self.record(LogLevel::Error, message);
    }

    /// Drains all log entries from the buffer
    ///
    /// Returns all buffered entries and clears the buffer
    pub fn drain_logs(&self) -> Vec<LogEntry> {
        let mut buffer = self.log_buffer.lock().unwrap();
        buffer.drain(..).collect()
    }
}
