//! Append-only audit trail.
//!
//! Services receive an `Arc<dyn AuditSink>` at construction; there is no
//! global recorder.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    ItemInserted {
        item_id: u64,
        model_version: String,
    },
    ItemDeleted {
        item_id: u64,
    },
    DocumentIndexed {
        document_id: u64,
        title: String,
        chunks: usize,
        failed: usize,
    },
    DocumentDeleted {
        document_id: u64,
        chunks: usize,
    },
    SearchExecuted {
        query_chars: usize,
        candidates: usize,
        results: usize,
    },
    MigrationFinished {
        total: usize,
        succeeded: usize,
        failed: usize,
        pruned: usize,
    },
}

/// One line of the audit trail.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: AuditEvent,
}

pub trait AuditSink: Send + Sync {
    /// Record an event. Must not fail the calling operation.
    fn record(&self, event: AuditEvent);
}

/// Writes events through the `log` facade.
#[derive(Debug, Default)]
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn record(&self, event: AuditEvent) {
        log::info!(target: "recall::audit", "{event:?}");
    }
}

/// Appends one JSON object per line to a file.
pub struct JsonlAuditSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlAuditSink {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, event: AuditEvent) {
        let record = AuditRecord {
            at: Utc::now(),
            event,
        };
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(err) => {
                log::error!("failed to serialize audit record: {err}");
                return;
            }
        };

        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(err) = writeln!(file, "{line}") {
            log::error!("failed to write audit log {}: {err}", self.path.display());
        }
    }
}

/// Keeps events in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jsonl_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit").join("events.jsonl");

        let sink = JsonlAuditSink::open(&path).unwrap();
        sink.record(AuditEvent::ItemInserted {
            item_id: 1,
            model_version: "m".to_string(),
        });
        sink.record(AuditEvent::ItemDeleted { item_id: 1 });
        drop(sink);

        // reopening appends instead of truncating
        let sink = JsonlAuditSink::open(&path).unwrap();
        sink.record(AuditEvent::DocumentDeleted {
            document_id: 2,
            chunks: 3,
        });

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["event"], "item_inserted");
        assert_eq!(lines[0]["item_id"], 1);
        assert_eq!(lines[2]["event"], "document_deleted");
        assert!(lines[2]["at"].is_string());
    }

    #[test]
    fn test_memory_sink_keeps_order() {
        let sink = MemoryAuditSink::default();
        sink.record(AuditEvent::ItemDeleted { item_id: 2 });
        sink.record(AuditEvent::ItemDeleted { item_id: 1 });

        assert_eq!(
            sink.events(),
            vec![
                AuditEvent::ItemDeleted { item_id: 2 },
                AuditEvent::ItemDeleted { item_id: 1 },
            ]
        );
    }
}
