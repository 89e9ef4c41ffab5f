//! Append-only event log carried by operations and rollouts

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single log line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in the log, unique and strictly increasing
    pub seq: u64,

    /// Wall-clock time of the append, never earlier than the previous entry
    pub at: DateTime<Utc>,

    /// Host the entry refers to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<Uuid>,

    pub message: String,
}

/// Append-only log keyed by sequence number.
///
/// Timestamps are informational; ordering and uniqueness come from `seq`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLog {
    entries: Vec<LogEntry>,
    next_seq: u64,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message and return its sequence number
    pub fn append(&mut self, host: Option<Uuid>, message: impl Into<String>) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;

        let now = Utc::now();
        let at = match self.entries.last() {
            Some(last) if last.at > now => last.at,
            _ => now,
        };

        self.entries.push(LogEntry {
            seq,
            at,
            host,
            message: message.into(),
        });
        seq
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Entries that refer to the given host
    pub fn for_host(&self, host: Uuid) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter().filter(move |e| e.host == Some(host))
    }

    pub fn last(&self) -> Option<&LogEntry> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether any message contains `needle`
    pub fn contains(&self, needle: &str) -> bool {
        self.entries.iter().any(|e| e.message.contains(needle))
    }
}
