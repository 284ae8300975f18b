//! Log sinks handed to subtasks at construction time.
//!
//! Two implementations are provided:
//! - [`BufferLog`]: appends records in-process, for tasks run inline.
//! - [`ChannelLog`]: pushes records onto an unbounded channel so that logs
//!   produced inside a worker reach the pool manager, which re-emits them
//!   through `tracing` when it flushes its log buffer.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Severity of a task log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// One log line produced by a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: LogLevel,
    /// Name of the task that produced the record.
    pub source: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogRecord {
    pub fn new(level: LogLevel, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            source: source.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Re-emit this record as a `tracing` event at its own level.
    pub fn emit(&self) {
        let source = self.source.as_str();
        match self.level {
            LogLevel::Debug => debug!(task = source, "{}", self.message),
            LogLevel::Info => info!(task = source, "{}", self.message),
            LogLevel::Warning => warn!(task = source, "{}", self.message),
            LogLevel::Error => error!(task = source, "{}", self.message),
        }
    }
}

/// Destination for task log records.
pub trait LogSink: Send + Sync + fmt::Debug {
    fn append(&self, record: LogRecord);
}

/// In-process sink that keeps every record in memory.
#[derive(Debug, Clone, Default)]
pub struct BufferLog {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl BufferLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all records appended so far.
    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Remove and return all records appended so far.
    pub fn drain(&self) -> Vec<LogRecord> {
        std::mem::take(&mut *self.records.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl LogSink for BufferLog {
    fn append(&self, record: LogRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }
}

/// Channel-backed sink: the producing half of the cross-boundary log channel.
#[derive(Debug, Clone)]
pub struct ChannelLog {
    tx: mpsc::UnboundedSender<LogRecord>,
}

impl LogSink for ChannelLog {
    fn append(&self, record: LogRecord) {
        // The receiver only goes away when the manager is dropped; records
        // produced after that have nowhere to go.
        let _ = self.tx.send(record);
    }
}

/// Consuming half of the log channel. Single consumer, owned by the manager.
#[derive(Debug)]
pub struct LogReceiver {
    rx: mpsc::UnboundedReceiver<LogRecord>,
}

impl LogReceiver {
    /// Take every record currently buffered without waiting.
    pub fn drain(&mut self) -> Vec<LogRecord> {
        let mut records = Vec::new();
        while let Ok(record) = self.rx.try_recv() {
            records.push(record);
        }
        records
    }
}

/// Create a connected log channel.
pub fn log_channel() -> (ChannelLog, LogReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelLog { tx }, LogReceiver { rx })
}
