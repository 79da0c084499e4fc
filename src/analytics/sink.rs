//! Analytics sinks.
//!
//! `emit` is called on the request path and must return as soon as the
//! record has been handed off. Every sink here either does constant work or
//! drops the record when its buffer is full; none of them waits.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing_appender::non_blocking::{NonBlocking, NonBlockingBuilder, WorkerGuard};

use super::record::AnalyticsRecord;

/// Destination for analytics records.
pub trait AnalyticsSink: Send + Sync {
    /// Hand off one record. Never blocks on downstream delivery.
    fn emit(&self, record: AnalyticsRecord);

    /// Flush whatever is buffered. Called once at worker shutdown; records
    /// emitted afterwards may be lost.
    fn close(&self) {}
}

impl<S: AnalyticsSink + ?Sized> AnalyticsSink for Arc<S> {
    fn emit(&self, record: AnalyticsRecord) {
        (**self).emit(record)
    }

    fn close(&self) {
        (**self).close()
    }
}

/// Writes each record as a structured `tracing` event on target `analytics`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl AnalyticsSink for TracingSink {
    fn emit(&self, record: AnalyticsRecord) {
        tracing::info!(
            target: "analytics",
            request_id = %record.request_id,
            sequence = record.sequence,
            attempt = record.attempt,
            queue_us = record.queue_duration_micros,
            processing_us = record.processing_duration_micros,
            gc_us = record.gc_duration_micros,
            status = ?record.status_code,
            error_kind = ?record.error_kind,
            "request dispatched"
        );
    }
}

/// Collects records in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<AnalyticsRecord>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn records(&self) -> Vec<AnalyticsRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AnalyticsSink for MemorySink {
    fn emit(&self, record: AnalyticsRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }
}

/// Forwards records into a bounded tokio channel. When the consumer falls
/// behind, new records are dropped and counted.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<AnalyticsRecord>,
    dropped: AtomicU64,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AnalyticsRecord>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Records discarded because the channel was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl AnalyticsSink for ChannelSink {
    fn emit(&self, record: AnalyticsRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                // Log at 1, 2, 4, 8... to keep a stalled consumer from flooding the log.
                if dropped.is_power_of_two() {
                    tracing::warn!(dropped, "Analytics channel full, dropping records");
                }
            }
            Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Analytics channel closed, dropping record");
            }
        }
    }
}

/// Appends one JSON object per line to a file.
///
/// Formatting happens on the caller's thread; the file write happens on a
/// dedicated `tracing-appender` worker thread fed by a bounded, lossy
/// queue.
pub struct JsonLinesSink {
    path: PathBuf,
    writer: NonBlocking,
    guard: Mutex<Option<WorkerGuard>>,
}

impl JsonLinesSink {
    /// Open (creating parent directories) `path` for appending.
    pub fn open(path: impl AsRef<Path>, buffered_lines: usize) -> std::io::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        let (writer, guard) = NonBlockingBuilder::default()
            .lossy(true)
            .buffered_lines_limit(buffered_lines.max(1))
            .thread_name("analytics-writer")
            .finish(file);

        Ok(Self {
            path: path.to_path_buf(),
            writer,
            guard: Mutex::new(Some(guard)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AnalyticsSink for JsonLinesSink {
    fn emit(&self, record: AnalyticsRecord) {
        let mut line = match serde_json::to_vec(&record) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize analytics record");
                return;
            }
        };
        line.push(b'\n');

        // One `write` call per line, so a line is queued whole or dropped whole.
        let mut writer = self.writer.clone();
        if let Err(e) = writer.write_all(&line) {
            tracing::debug!(error = %e, path = %self.path.display(), "Analytics line not queued");
        }
    }

    fn close(&self) {
        // Dropping the guard drains the queue and joins the writer thread.
        let guard = self.guard.lock().ok().and_then(|mut g| g.take());
        drop(guard);
    }
}

impl std::fmt::Debug for JsonLinesSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonLinesSink")
            .field("path", &self.path)
            .finish()
    }
}
