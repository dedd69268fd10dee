//! In-memory log ring buffer backing `GET /api/logs`.
//!
//! Holds the last N entries (default 1000) of the proxy's request/response
//! journal. Entries carry a structured `data` payload so the web UI can show
//! full request headers and bodies that would be too noisy for stdout.
//! Oldest entries are silently dropped when the buffer is full.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;

/// Severity of a [`LogEntry`], serialized uppercase (`"INFO"`, `"ERROR"`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A single entry in the ring buffer.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
    pub level: LogLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Fixed-capacity ring of [`LogEntry`] items.
pub struct LogBuffer {
    entries: RwLock<VecDeque<LogEntry>>,
    max_entries: usize,
}

impl LogBuffer {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(max_entries.min(256))),
            max_entries,
        }
    }

    /// Append an entry, evicting the oldest if at capacity.
    pub async fn append(&self, level: LogLevel, message: impl Into<String>, data: Option<Value>) {
        #[allow(clippy::cast_possible_truncation)]
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        let mut entries = self.entries.write().await;
        if entries.len() >= self.max_entries {
            entries.pop_front();
        }
        entries.push_back(LogEntry {
            timestamp,
            level,
            message: message.into(),
            data,
        });
    }

    /// Snapshot of all retained entries, oldest first.
    pub async fn snapshot(&self) -> Vec<LogEntry> {
        self.entries.read().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_append_and_snapshot() {
        let buf = LogBuffer::new(10);
        buf.append(LogLevel::Info, "first", None).await;
        buf.append(LogLevel::Error, "second", Some(json!({"status": 502})))
            .await;

        let entries = buf.snapshot().await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "first");
        assert_eq!(entries[1].level, LogLevel::Error);
        assert_eq!(entries[1].data.as_ref().unwrap()["status"], 502);
    }

    #[tokio::test]
    async fn test_ring_evicts_oldest() {
        let buf = LogBuffer::new(3);
        for i in 0..5 {
            buf.append(LogLevel::Info, format!("entry-{i}"), None).await;
        }
        let entries = buf.snapshot().await;
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].message, "entry-2");
        assert_eq!(entries[2].message, "entry-4");
    }

    #[test]
    fn test_level_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&LogLevel::Warn).unwrap(), "\"WARN\"");
        assert_eq!(serde_json::to_string(&LogLevel::Error).unwrap(), "\"ERROR\"");
    }
}
