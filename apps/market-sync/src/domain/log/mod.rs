//! Diagnostic Log Buffer
//!
//! Bounded, append-only history of lifecycle and failure messages shown in
//! the dashboard's activity panel. Holds at most [`LOG_CAPACITY`] entries and
//! evicts the oldest first.

use std::collections::VecDeque;

use chrono::{DateTime, Local};
use serde::{Serialize, Serializer};

/// Maximum number of retained log entries.
pub const LOG_CAPACITY: usize = 50;

/// Severity class of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    /// Routine information.
    Info,
    /// A lifecycle step completed.
    Success,
    /// Something failed or degraded.
    Alert,
}

impl LogKind {
    /// Get the kind name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Alert => "alert",
        }
    }
}

/// A single diagnostic line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    /// Local wall-clock time of the append, `HH:MM:SS`.
    pub time: String,
    /// Message text.
    pub message: String,
    /// Entry kind.
    pub kind: LogKind,
}

/// Bounded FIFO log.
///
/// Cloning is cheap enough (at most fifty short strings) that every published
/// state carries its own copy, so readers never observe later appends.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl LogBuffer {
    /// Create an empty buffer with the standard capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(LOG_CAPACITY)
    }

    /// Create an empty buffer holding at most `capacity` entries.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a message stamped with the current local time.
    pub fn append(&mut self, message: impl Into<String>, kind: LogKind) {
        self.append_at(message, kind, Local::now());
    }

    /// Append a message stamped with the given time.
    pub fn append_at(&mut self, message: impl Into<String>, kind: LogKind, at: DateTime<Local>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(LogEntry {
            time: at.format("%H:%M:%S").to_string(),
            message: message.into(),
            kind,
        });
    }

    /// Iterate entries oldest first.
    pub fn entries(&self) -> impl DoubleEndedIterator<Item = &LogEntry> + ExactSizeIterator + Clone {
        self.entries.iter()
    }

    /// Most recently appended entry.
    #[must_use]
    pub fn latest(&self) -> Option<&LogEntry> {
        self.entries.back()
    }

    /// Number of retained entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been appended yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of retained entries.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Serialize for LogBuffer {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.entries.iter())
    }
}
