//! # Error Collector
//!
//! Bounded in-memory error collection with minimal overhead.
//!
//! Records are buffered in a ring; when the buffer overflows, the oldest
//! records are dropped and a counter increments. Handlers may subscribe to
//! receive records synchronously at collection time for alerting. The
//! buffer is drained asynchronously by the pipeline's flush path into the
//! `error_records` table.

use crate::error::{ErrorRecord, PipelineError, Severity};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Handler invoked synchronously on every collected record
pub type ErrorHandler = Box<dyn Fn(&ErrorRecord) + Send + Sync>;

/// Collector configuration
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Maximum records held in memory
    pub buffer_capacity: usize,

    /// Minimum severity to collect
    pub min_severity: Severity,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 10_000,
            min_severity: Severity::Low,
        }
    }
}

/// Collector statistics
#[derive(Debug, Clone, Default)]
pub struct CollectorStats {
    /// Records accepted into the buffer
    pub collected: u64,

    /// Records dropped on buffer overflow
    pub dropped: u64,

    /// Records below the severity floor
    pub filtered: u64,

    /// Records handed to the flush path
    pub flushed: u64,

    /// Current buffer size
    pub buffered: usize,
}

/// Bounded error collector
pub struct ErrorCollector {
    /// Ring buffer of pending records
    buffer: RwLock<VecDeque<ErrorRecord>>,

    /// Synchronous subscribers
    handlers: RwLock<Vec<ErrorHandler>>,

    /// Configuration
    config: CollectorConfig,

    /// Total collected
    collected: AtomicU64,

    /// Total dropped on overflow
    dropped: AtomicU64,

    /// Total filtered by severity
    filtered: AtomicU64,

    /// Total flushed
    flushed: AtomicU64,
}

impl ErrorCollector {
    /// Create a new collector
    pub fn new(config: CollectorConfig) -> Self {
        Self {
            buffer: RwLock::new(VecDeque::with_capacity(config.buffer_capacity.min(1024))),
            handlers: RwLock::new(Vec::new()),
            config,
            collected: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            filtered: AtomicU64::new(0),
            flushed: AtomicU64::new(0),
        }
    }

    /// Create a collector with default configuration
    pub fn with_defaults() -> Arc<Self> {
        Arc::new(Self::new(CollectorConfig::default()))
    }

    /// Collect an error, converting it to a record
    pub fn collect(&self, error: &PipelineError) -> ErrorRecord {
        let record = error.to_record();
        self.collect_record(record.clone());
        record
    }

    /// Collect a pre-built record
    pub fn collect_record(&self, record: ErrorRecord) {
        if record.severity < self.config.min_severity {
            self.filtered.fetch_add(1, Ordering::Relaxed);
            return;
        }

        // Subscribers run synchronously, before buffering
        for handler in self.handlers.read().iter() {
            handler(&record);
        }

        let mut buffer = self.buffer.write();
        if buffer.len() >= self.config.buffer_capacity {
            buffer.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        buffer.push_back(record);
        self.collected.fetch_add(1, Ordering::Relaxed);
    }

    /// Register a synchronous handler for alerting
    pub fn subscribe(&self, handler: ErrorHandler) {
        self.handlers.write().push(handler);
    }

    /// Drain up to `limit` records for persistence
    ///
    /// Drained records leave the buffer; the caller owns delivery.
    pub fn drain(&self, limit: usize) -> Vec<ErrorRecord> {
        let mut buffer = self.buffer.write();
        let n = limit.min(buffer.len());
        let drained: Vec<ErrorRecord> = buffer.drain(..n).collect();
        self.flushed.fetch_add(drained.len() as u64, Ordering::Relaxed);
        drained
    }

    /// Snapshot the buffer without draining (analytics reads)
    pub fn snapshot(&self) -> Vec<ErrorRecord> {
        self.buffer.read().iter().cloned().collect()
    }

    /// Number of buffered records
    pub fn len(&self) -> usize {
        self.buffer.read().len()
    }

    /// Whether the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.buffer.read().is_empty()
    }

    /// Collector statistics
    pub fn stats(&self) -> CollectorStats {
        CollectorStats {
            collected: self.collected.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            flushed: self.flushed.load(Ordering::Relaxed),
            buffered: self.len(),
        }
    }

    /// Clear the buffer and counters
    pub fn clear(&self) {
        self.buffer.write().clear();
        self.collected.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
        self.filtered.store(0, Ordering::Relaxed);
        self.flushed.store(0, Ordering::Relaxed);
    }
}
