//! # Adaptive Rebalancing
//!
//! Wraps the sharded limiter with load-imbalance detection. Per-shard hit
//! counts accumulate over a sampling window; on call paths (never a timer),
//! once per `rebalance_interval` the imbalance ratio is evaluated and, if
//! it exceeds the threshold, the primary hash seed rotates and the
//! counters zero. Re-routing is eventual: reservations made before a
//! rotation keep their shard and drain there.

use crate::ratelimit::bucket::Reservation;
use crate::ratelimit::sharded::{AcquireResult, LimiterStatus, ShardedRateLimiter};
use crate::ratelimit::{RateLimiterConfig, Result};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Sharded rate limiter with adaptive seed rotation
pub struct AdaptiveRateLimiter {
    /// Underlying sharded limiter
    inner: ShardedRateLimiter,

    /// Last rebalance check
    last_check: Mutex<Instant>,

    /// Imbalance threshold that triggers a rotation
    rebalance_threshold: f64,

    /// Minimum interval between checks
    rebalance_interval: Duration,

    /// Rotations performed
    rebalances: AtomicU64,
}

impl AdaptiveRateLimiter {
    /// Create an adaptive limiter
    pub fn new(config: RateLimiterConfig) -> Self {
        let rebalance_threshold = config.rebalance_threshold;
        let rebalance_interval = config.rebalance_interval;
        Self {
            inner: ShardedRateLimiter::new(config),
            last_check: Mutex::new(Instant::now()),
            rebalance_threshold,
            rebalance_interval,
            rebalances: AtomicU64::new(0),
        }
    }

    /// Non-blocking acquire with a rebalance check
    pub fn try_acquire(&self, key: &str, count: u64) -> AcquireResult {
        self.maybe_rebalance();
        self.inner.try_acquire(key, count)
    }

    /// Blocking acquire with a rebalance check
    pub async fn acquire(&self, key: &str, count: u64) -> AcquireResult {
        self.maybe_rebalance();
        self.inner.acquire(key, count).await
    }

    /// Reserve on the key's current primary shard
    pub fn reserve(&self, key: &str, count: u64, max_wait: Duration) -> Result<Reservation> {
        self.inner.reserve(key, count, max_wait)
    }

    /// Execute a reservation on the shard it was made on
    ///
    /// Deliberately skips the rebalance check: reservations drain on their
    /// original shard regardless of seed rotations.
    pub fn execute_reservation(&self, id: Uuid) -> Result<AcquireResult> {
        self.inner.execute_reservation(id)
    }

    /// Cancel a reservation
    pub fn cancel_reservation(&self, id: Uuid) -> bool {
        self.inner.cancel_reservation(id)
    }

    /// Aggregate status
    pub fn status(&self) -> LimiterStatus {
        self.inner.status()
    }

    /// Reset buckets, reservations, and counters
    pub fn reset(&self) {
        self.inner.reset();
        *self.last_check.lock() = Instant::now();
    }

    /// Number of seed rotations performed
    pub fn rebalance_count(&self) -> u64 {
        self.rebalances.load(Ordering::Relaxed)
    }

    /// The underlying sharded limiter
    pub fn inner(&self) -> &ShardedRateLimiter {
        &self.inner
    }

    /// Rotate the seed when the sampling window shows imbalance
    fn maybe_rebalance(&self) {
        if self.inner.shard_count() < 2 {
            return;
        }

        {
            let mut last = self.last_check.lock();
            if last.elapsed() < self.rebalance_interval {
                return;
            }
            *last = Instant::now();
        }

        let hits = self.inner.shard_hits();
        let total: u64 = hits.iter().sum();
        if total == 0 {
            return;
        }

        let max = *hits.iter().max().unwrap() as f64;
        let min = *hits.iter().min().unwrap() as f64;
        let avg = total as f64 / hits.len() as f64;
        let imbalance = (max - min) / avg;

        if imbalance > self.rebalance_threshold {
            let new_seed = rand::thread_rng().gen::<u64>();
            self.inner.rotate_seed(new_seed);
            self.rebalances.fetch_add(1, Ordering::Relaxed);
            log::debug!(
                "imbalance {:.2} exceeded threshold {:.2}",
                imbalance,
                self.rebalance_threshold
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(shards: usize) -> RateLimiterConfig {
        RateLimiterConfig {
            rate: 10_000,
            period: Duration::from_secs(1),
            shards: Some(shards),
            burst: Some(10_000),
            rebalance_interval: Duration::from_millis(0),
            rebalance_threshold: 0.5,
            ..Default::default()
        }
    }

    #[test]
    fn test_hot_key_triggers_rotation() {
        let limiter = AdaptiveRateLimiter::new(config(4));

        // A single hot key lands on at most two shards, which makes the
        // imbalance ratio exceed any sub-2.0 threshold.
        for _ in 0..500 {
            limiter.try_acquire("hot-key", 1);
        }

        assert!(limiter.rebalance_count() >= 1);
    }

    #[test]
    fn test_single_shard_never_rebalances() {
        let limiter = AdaptiveRateLimiter::new(config(1));
        for _ in 0..200 {
            limiter.try_acquire("hot-key", 1);
        }
        assert_eq!(limiter.rebalance_count(), 0);
    }

    #[test]
    fn test_reservation_survives_rotation() {
        let limiter = AdaptiveRateLimiter::new(config(4));
        let reservation = limiter
            .reserve("steady", 1, Duration::from_secs(1))
            .unwrap();

        // Force rotations with a hot key
        for _ in 0..500 {
            limiter.try_acquire("hot-key", 1);
        }
        assert!(limiter.rebalance_count() >= 1);

        // The reservation still executes on its original shard
        let result = limiter.execute_reservation(reservation.id).unwrap();
        assert!(result.allowed);
        assert_eq!(result.shard_id, reservation.shard_id);
    }

    #[test]
    fn test_rotation_zeroes_counters() {
        let limiter = AdaptiveRateLimiter::new(config(4));
        for _ in 0..500 {
            limiter.try_acquire("hot-key", 1);
        }
        assert!(limiter.rebalance_count() >= 1);

        let hits = limiter.inner().shard_hits();
        let max_after: u64 = *hits.iter().max().unwrap();
        // Counters were zeroed at the last rotation, so the residue is
        // bounded by the calls made since then, far below 500.
        assert!(max_after < 500);
    }
}
