//! Structured JSONL logging.
//!
//! Every record is one JSON object per line:
//!
//! ```text
//! {"timestamp":"1718000000.123","level":"warn","event":"thread.set_priority","thread":3,"fields":{"errno":1}}
//! ```
//!
//! Records go to the file named by `GUESTSYNC_LOG_FILE`, or to stderr. The
//! level filter comes from [`crate::config::log_level`].
//!
//! Nothing in this module is async-signal-safe. Signal handlers must never
//! log; they hand work back to ordinary thread context instead.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config;
use crate::ident;

/// Severity level for log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Canonical structured log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub level: LogLevel,
    pub event: String,
    /// Process-unique identity of the emitting thread.
    pub thread: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<serde_json::Value>,
}

impl LogEntry {
    #[must_use]
    pub fn new(level: LogLevel, event: &str) -> Self {
        Self {
            timestamp: unix_timestamp(),
            level,
            event: event.to_owned(),
            thread: ident::current_thread_token(),
            fields: None,
        }
    }

    #[must_use]
    pub fn with_fields(mut self, fields: serde_json::Value) -> Self {
        self.fields = Some(fields);
        self
    }

    /// Serialize to a single JSONL line (no trailing newline).
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

fn unix_timestamp() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}.{:03}", now.as_secs(), now.subsec_millis())
}

enum Sink {
    Stderr,
    File(File),
}

fn sink() -> &'static Mutex<Sink> {
    static SINK: OnceLock<Mutex<Sink>> = OnceLock::new();
    SINK.get_or_init(|| {
        let sink = config::log_file_path()
            .and_then(|path| OpenOptions::new().create(true).append(true).open(path).ok())
            .map_or(Sink::Stderr, Sink::File);
        Mutex::new(sink)
    })
}

/// Returns true if records at `level` pass the configured filter.
#[must_use]
pub fn enabled(level: LogLevel) -> bool {
    level != LogLevel::Off && level <= config::log_level()
}

/// Write one record to the configured sink. Write errors are dropped.
pub fn write_entry(entry: &LogEntry) {
    let Ok(line) = entry.to_jsonl() else {
        return;
    };
    let mut guard = sink().lock();
    let _ = match &mut *guard {
        Sink::Stderr => writeln!(std::io::stderr().lock(), "{line}"),
        Sink::File(file) => writeln!(file, "{line}"),
    };
}

/// Emit `event` at `level` with optional structured fields.
pub fn emit(level: LogLevel, event: &str, fields: Option<serde_json::Value>) {
    if !enabled(level) {
        return;
    }
    let mut entry = LogEntry::new(level, event);
    entry.fields = fields;
    write_entry(&entry);
}

pub fn error(event: &str, fields: serde_json::Value) {
    emit(LogLevel::Error, event, Some(fields));
}

pub fn warn(event: &str, fields: serde_json::Value) {
    emit(LogLevel::Warn, event, Some(fields));
}

pub fn debug(event: &str, fields: serde_json::Value) {
    emit(LogLevel::Debug, event, Some(fields));
}

pub fn trace(event: &str, fields: serde_json::Value) {
    emit(LogLevel::Trace, event, Some(fields));
}
