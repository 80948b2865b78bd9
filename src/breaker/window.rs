//! # Rolling Outcome Window
//!
//! Bounded deque of `(timestamp, outcome)` samples over the breaker's
//! sampling duration. Stale entries are evicted before every threshold
//! evaluation, so only in-window samples contribute.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Counts over the current window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowCounts {
    /// All calls in the window
    pub total: u64,

    /// Successful calls
    pub successes: u64,

    /// Failed calls
    pub failures: u64,
}

impl WindowCounts {
    /// Failure rate in [0, 1]; zero for an empty window
    pub fn failure_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.failures as f64 / self.total as f64
        }
    }
}

/// Rolling window of call outcomes
#[derive(Debug)]
pub struct RollingWindow {
    /// Samples: (observed at, success)
    samples: VecDeque<(Instant, bool)>,

    /// Window length
    sampling_duration: Duration,
}

impl RollingWindow {
    /// Create an empty window
    pub fn new(sampling_duration: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            sampling_duration,
        }
    }

    /// Record one outcome
    pub fn record(&mut self, success: bool, now: Instant) {
        self.samples.push_back((now, success));
    }

    /// Evict samples older than the sampling duration
    pub fn evict(&mut self, now: Instant) {
        while let Some(&(timestamp, _)) = self.samples.front() {
            if now.saturating_duration_since(timestamp) > self.sampling_duration {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Evict stale samples, then count the remainder
    pub fn counts(&mut self, now: Instant) -> WindowCounts {
        self.evict(now);
        let total = self.samples.len() as u64;
        let successes = self.samples.iter().filter(|(_, ok)| *ok).count() as u64;
        WindowCounts {
            total,
            successes,
            failures: total - successes,
        }
    }

    /// Drop all samples
    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_add_up() {
        let mut window = RollingWindow::new(Duration::from_secs(60));
        let now = Instant::now();
        window.record(true, now);
        window.record(false, now);
        window.record(false, now);

        let counts = window.counts(now);
        assert_eq!(counts.total, 3);
        assert_eq!(counts.successes + counts.failures, counts.total);
        assert!((counts.failure_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_stale_samples_evicted() {
        let mut window = RollingWindow::new(Duration::from_secs(1));
        let start = Instant::now();
        window.record(false, start);
        window.record(false, start);

        let later = start + Duration::from_secs(2);
        window.record(true, later);

        let counts = window.counts(later);
        assert_eq!(counts.total, 1);
        assert_eq!(counts.failures, 0);
    }

    #[test]
    fn test_empty_window_rate_is_zero() {
        let mut window = RollingWindow::new(Duration::from_secs(1));
        assert_eq!(window.counts(Instant::now()).failure_rate(), 0.0);
    }
}
