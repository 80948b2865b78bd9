//! # Progress Reporting
//!
//! Batch counters with cadence-limited callbacks. Callbacks fire at most
//! every `min_interval` or every percent of total progress, whichever
//! comes first, and never run while a worker lock is held.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Point-in-time progress view
#[derive(Debug, Clone, Copy)]
pub struct ProgressSnapshot {
    /// Batch size
    pub total: usize,

    /// Workers started
    pub started: u64,

    /// Items completed (success or failure)
    pub completed: u64,

    /// Items failed
    pub failed: u64,

    /// Items served from cache
    pub from_cache: u64,

    /// Completed over total, in percent
    pub percent: f64,

    /// Time since the batch began
    pub elapsed: Duration,
}

/// Callback invoked on progress ticks
pub type ProgressCallback = Box<dyn Fn(ProgressSnapshot) + Send + Sync>;

/// Cadence-limited progress reporter
pub struct ProgressReporter {
    total: usize,
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    from_cache: AtomicU64,
    begun_at: Instant,
    min_interval: Duration,
    callbacks: Mutex<Vec<ProgressCallback>>,
    last_tick: Mutex<(Instant, u64)>,
}

impl ProgressReporter {
    /// Create a reporter for a batch of `total` items
    pub fn new(total: usize, min_interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            total,
            started: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            from_cache: AtomicU64::new(0),
            begun_at: now,
            min_interval,
            callbacks: Mutex::new(Vec::new()),
            last_tick: Mutex::new((now.checked_sub(min_interval).unwrap_or(now), 0)),
        }
    }

    /// Register a callback
    pub fn subscribe(&self, callback: ProgressCallback) {
        self.callbacks.lock().push(callback);
    }

    /// Record a worker start
    pub fn record_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one completed item
    pub fn record_completed(&self, failed: bool, from_cache: bool) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        if from_cache {
            self.from_cache.fetch_add(1, Ordering::Relaxed);
        }
        self.maybe_tick();
    }

    /// Current snapshot
    pub fn snapshot(&self) -> ProgressSnapshot {
        let completed = self.completed.load(Ordering::Relaxed);
        ProgressSnapshot {
            total: self.total,
            started: self.started.load(Ordering::Relaxed),
            completed,
            failed: self.failed.load(Ordering::Relaxed),
            from_cache: self.from_cache.load(Ordering::Relaxed),
            percent: if self.total == 0 {
                100.0
            } else {
                completed as f64 * 100.0 / self.total as f64
            },
            elapsed: self.begun_at.elapsed(),
        }
    }

    /// Fire callbacks when the cadence allows
    fn maybe_tick(&self) {
        let snapshot = self.snapshot();
        let percent_step = snapshot.percent as u64;

        let due = {
            let mut last = self.last_tick.lock();
            let (last_at, last_percent) = *last;
            let interval_due = last_at.elapsed() >= self.min_interval;
            let percent_due = percent_step > last_percent;
            if interval_due || percent_due {
                *last = (Instant::now(), percent_step);
                true
            } else {
                false
            }
        };

        if due {
            for callback in self.callbacks.lock().iter() {
                callback(snapshot);
            }
        }
    }

    /// Fire callbacks unconditionally (batch end)
    pub fn final_tick(&self) {
        let snapshot = self.snapshot();
        for callback in self.callbacks.lock().iter() {
            callback(snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_counters() {
        let reporter = ProgressReporter::new(10, Duration::from_millis(100));
        reporter.record_started();
        reporter.record_completed(false, true);
        reporter.record_completed(true, false);

        let snapshot = reporter.snapshot();
        assert_eq!(snapshot.completed, 2);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.from_cache, 1);
        assert!((snapshot.percent - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_percent_step_triggers_callback() {
        let reporter = ProgressReporter::new(4, Duration::from_secs(3600));
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticks_clone = ticks.clone();
        reporter.subscribe(Box::new(move |_s| {
            ticks_clone.fetch_add(1, Ordering::SeqCst);
        }));

        // Each completion advances 25%, so each one ticks despite the
        // hour-long interval
        for _ in 0..4 {
            reporter.record_completed(false, false);
        }
        assert_eq!(ticks.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_interval_limits_cadence() {
        let reporter = ProgressReporter::new(100_000, Duration::from_secs(3600));
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticks_clone = ticks.clone();
        reporter.subscribe(Box::new(move |_s| {
            ticks_clone.fetch_add(1, Ordering::SeqCst);
        }));

        // Sub-percent progress under a long interval: at most the
        // initial percent rollover fires
        for _ in 0..100 {
            reporter.record_completed(false, false);
        }
        assert!(ticks.load(Ordering::SeqCst) <= 1);
    }

    #[test]
    fn test_empty_batch_is_complete() {
        let reporter = ProgressReporter::new(0, Duration::from_millis(100));
        assert_eq!(reporter.snapshot().percent, 100.0);
    }
}
