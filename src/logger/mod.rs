//! Structured decision logging: JSONL append-only with graceful degradation.

pub mod jsonl;

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::logger::jsonl::{JsonlConfig, JsonlWriter, LogEntry};

/// Thread-safe handle over one [`JsonlWriter`], shared by the orchestrator and gateway.
///
/// Writes never fail from the caller's point of view; the writer degrades instead.
pub struct DecisionLog {
    writer: Mutex<JsonlWriter>,
    entries: AtomicU64,
}

impl DecisionLog {
    /// Open the log, falling through the writer's degradation chain as needed.
    pub fn open(config: JsonlConfig) -> Self {
        Self {
            writer: Mutex::new(JsonlWriter::open(config)),
            entries: AtomicU64::new(0),
        }
    }

    /// Append one entry and flush it, so a tailing reader sees it immediately.
    pub fn record(&self, entry: &LogEntry) {
        let mut writer = self.writer.lock();
        writer.write_entry(entry);
        writer.flush();
        drop(writer);
        self.entries.fetch_add(1, Ordering::Relaxed);
    }

    /// Entries recorded through this handle.
    pub fn entries(&self) -> u64 {
        self.entries.load(Ordering::Relaxed)
    }

    /// Degradation state of the underlying writer.
    pub fn state(&self) -> &'static str {
        self.writer.lock().state()
    }

    /// Flush and fsync.
    pub fn sync(&self) {
        self.writer.lock().fsync();
    }
}
