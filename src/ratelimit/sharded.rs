//! # Sharded Rate Limiter
//!
//! Distributes load across independent token-bucket shards to avoid
//! single-lock contention while preserving the aggregate rate. Keys route
//! to a primary and a secondary shard under two distinct stable hashes;
//! trying both bounds the worst-case load imbalance (two-choice routing).
//!
//! No operation holds more than one shard lock at a time, and no lock is
//! held across a sleep.

use crate::ratelimit::bucket::{Reservation, TokenBucketShard};
use crate::ratelimit::{RateLimitError, RateLimiterConfig, Result};
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Result of an acquire attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcquireResult {
    /// Whether the tokens were granted
    pub allowed: bool,

    /// Shard that granted (or last refused) the request
    pub shard_id: usize,

    /// Token level on that shard after the attempt
    pub tokens_remaining: f64,

    /// Time until the request could succeed, when refused
    pub retry_after: Option<Duration>,
}

/// Snapshot of one shard for `status()`
#[derive(Debug, Clone, Copy)]
pub struct ShardSnapshot {
    /// Shard index
    pub shard_id: usize,

    /// Current token level
    pub tokens: f64,

    /// Shard capacity
    pub capacity: f64,

    /// Requests routed to this shard since the last reset
    pub hits: u64,
}

/// Aggregate limiter status
#[derive(Debug, Clone)]
pub struct LimiterStatus {
    /// Number of shards
    pub shards: usize,

    /// Requests allowed since creation or reset
    pub allowed: u64,

    /// Requests refused since creation or reset
    pub refused: u64,

    /// Outstanding reservations
    pub pending_reservations: usize,

    /// Per-shard snapshots
    pub shard_details: Vec<ShardSnapshot>,

    /// (max - min) / avg over per-shard hit counts
    pub imbalance_ratio: f64,
}

/// One shard: a bucket behind its own lock plus a routing hit counter
struct Shard {
    bucket: Mutex<TokenBucketShard>,
    hits: AtomicU64,
}

/// Sharded token-bucket rate limiter
pub struct ShardedRateLimiter {
    /// Shards; index is the shard id
    shards: Vec<Shard>,

    /// Hash seeds for primary and secondary routing
    seeds: [AtomicU64; 2],

    /// Outstanding reservations by id
    reservations: Mutex<HashMap<Uuid, Reservation>>,

    /// Configuration
    config: RateLimiterConfig,

    /// Allowed counter
    allowed: AtomicU64,

    /// Refused counter
    refused: AtomicU64,
}

impl ShardedRateLimiter {
    /// Create a limiter from configuration
    ///
    /// Shard count is the configured value if explicit, otherwise the next
    /// power of two of `ceil(log2(rate / 100))`, clamped to `[1, max_shards]`
    /// with an absolute cap of 32. Capacity and rate are distributed evenly;
    /// the integer remainder of the capacity goes to the first shards so the
    /// aggregate burst is exact.
    pub fn new(config: RateLimiterConfig) -> Self {
        let shard_count = config
            .shards
            .unwrap_or_else(|| Self::optimal_shard_count(config.rate, config.max_shards));

        let burst = config.burst.unwrap_or(config.rate).max(1);
        let per_second = config.rate as f64 / config.period.as_secs_f64();

        let base_capacity = burst / shard_count as u64;
        let remainder = (burst % shard_count as u64) as usize;
        let per_shard_rate = per_second / shard_count as f64;

        let shards = (0..shard_count)
            .map(|i| {
                let capacity = base_capacity + u64::from(i < remainder);
                Shard {
                    bucket: Mutex::new(TokenBucketShard::new(capacity as f64, per_shard_rate)),
                    hits: AtomicU64::new(0),
                }
            })
            .collect();

        log::debug!(
            "rate limiter: {} shards, burst {}, {:.3} tokens/s aggregate",
            shard_count,
            burst,
            per_second
        );

        Self {
            shards,
            seeds: [AtomicU64::new(0x9e37_79b9), AtomicU64::new(0x85eb_ca6b)],
            reservations: Mutex::new(HashMap::new()),
            config,
            allowed: AtomicU64::new(0),
            refused: AtomicU64::new(0),
        }
    }

    /// Next power of two of `ceil(log2(rate / 100))`, clamped to
    /// `[1, min(max_shards, 32)]`
    pub fn optimal_shard_count(rate: u64, max_shards: usize) -> usize {
        let cap = max_shards.clamp(1, 32);
        if rate <= 100 {
            return 1;
        }
        let suggested = ((rate as f64) / 100.0).log2().ceil() as u32;
        let count = 2usize.pow(suggested.min(5));
        count.clamp(1, cap)
    }

    /// Number of shards
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Route a key to its (primary, secondary) shards under the current seeds
    ///
    /// The secondary is forced distinct from the primary whenever more
    /// than one shard exists, so two-choice fallback always reaches a
    /// second bucket.
    pub fn route(&self, key: &str) -> (usize, usize) {
        let s = self.shards.len();
        let primary = Self::seeded_hash(self.seeds[0].load(Ordering::Acquire), key) as usize % s;
        let mut secondary =
            Self::seeded_hash(self.seeds[1].load(Ordering::Acquire), key) as usize % s;
        if secondary == primary && s > 1 {
            secondary = (secondary + 1) % s;
        }
        (primary, secondary)
    }

    fn seeded_hash(seed: u64, key: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        seed.hash(&mut hasher);
        key.hash(&mut hasher);
        hasher.finish()
    }

    /// Non-blocking acquire; never sleeps
    ///
    /// Tries the primary shard first, falling back to the secondary on
    /// refusal. The returned `retry_after` is the smaller of the two
    /// shards' estimates.
    pub fn try_acquire(&self, key: &str, count: u64) -> AcquireResult {
        self.sweep_expired_reservations();

        let (primary, secondary) = self.route(key);
        let now = Instant::now();
        let count = count as f64;

        let first = {
            let mut bucket = self.shards[primary].bucket.lock();
            bucket.try_consume(count, now)
        };
        if first.allowed {
            self.shards[primary].hits.fetch_add(1, Ordering::Relaxed);
            self.allowed.fetch_add(1, Ordering::Relaxed);
            return AcquireResult {
                allowed: true,
                shard_id: primary,
                tokens_remaining: first.tokens_remaining,
                retry_after: None,
            };
        }

        if secondary != primary {
            let second = {
                let mut bucket = self.shards[secondary].bucket.lock();
                bucket.try_consume(count, now)
            };
            if second.allowed {
                self.shards[secondary].hits.fetch_add(1, Ordering::Relaxed);
                self.allowed.fetch_add(1, Ordering::Relaxed);
                return AcquireResult {
                    allowed: true,
                    shard_id: secondary,
                    tokens_remaining: second.tokens_remaining,
                    retry_after: None,
                };
            }

            self.refused.fetch_add(1, Ordering::Relaxed);
            let retry_after = match (first.retry_after, second.retry_after) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            return AcquireResult {
                allowed: false,
                shard_id: secondary,
                tokens_remaining: second.tokens_remaining,
                retry_after,
            };
        }

        self.refused.fetch_add(1, Ordering::Relaxed);
        AcquireResult {
            allowed: false,
            shard_id: primary,
            tokens_remaining: first.tokens_remaining,
            retry_after: first.retry_after,
        }
    }

    /// Blocking acquire; sleeps between attempts up to `max_wait`
    pub async fn acquire(&self, key: &str, count: u64) -> AcquireResult {
        let deadline = Instant::now() + self.config.max_wait;

        loop {
            let result = self.try_acquire(key, count);
            if result.allowed {
                return result;
            }

            let now = Instant::now();
            if now >= deadline {
                return result;
            }

            let wait = result
                .retry_after
                .unwrap_or(Duration::from_millis(50))
                .min(deadline.saturating_duration_since(now));
            tokio::time::sleep(wait).await;
        }
    }

    /// Reserve `count` tokens on the key's primary shard
    ///
    /// Refused when the computed execution time exceeds `max_wait`.
    pub fn reserve(&self, key: &str, count: u64, max_wait: Duration) -> Result<Reservation> {
        self.sweep_expired_reservations();

        let (primary, _) = self.route(key);
        let now = Instant::now();

        let reservation = {
            let mut bucket = self.shards[primary].bucket.lock();
            bucket.reserve(
                key,
                count as f64,
                max_wait,
                self.config.reservation_grace,
                primary,
                now,
            )
        };

        match reservation {
            Some(reservation) => {
                self.reservations
                    .lock()
                    .insert(reservation.id, reservation.clone());
                Ok(reservation)
            }
            None => Err(RateLimitError::ReservationRefused {
                key: key.to_string(),
                max_wait,
            }),
        }
    }

    /// Execute a previously-made reservation
    ///
    /// Fails `NotReady` before `execute_at` (reservation stays pending) and
    /// `Expired` after `expires_at` (commitment released).
    pub fn execute_reservation(&self, id: Uuid) -> Result<AcquireResult> {
        let now = Instant::now();

        let reservation = {
            let reservations = self.reservations.lock();
            reservations
                .get(&id)
                .cloned()
                .ok_or(RateLimitError::ReservationNotFound(id))?
        };

        if now > reservation.expires_at {
            self.reservations.lock().remove(&id);
            self.shards[reservation.shard_id]
                .bucket
                .lock()
                .release_reservation(reservation.count);
            return Err(RateLimitError::ReservationExpired(id));
        }

        if now < reservation.execute_at {
            return Err(RateLimitError::ReservationNotReady {
                id,
                ready_in: reservation.execute_at - now,
            });
        }

        self.reservations.lock().remove(&id);
        let outcome = {
            let mut bucket = self.shards[reservation.shard_id].bucket.lock();
            bucket.execute_reservation(reservation.count, now)
        };
        self.shards[reservation.shard_id]
            .hits
            .fetch_add(1, Ordering::Relaxed);
        self.allowed.fetch_add(1, Ordering::Relaxed);

        Ok(AcquireResult {
            allowed: true,
            shard_id: reservation.shard_id,
            tokens_remaining: outcome.tokens_remaining,
            retry_after: None,
        })
    }

    /// Cancel a reservation, releasing its commitment
    ///
    /// Returns whether the reservation existed.
    pub fn cancel_reservation(&self, id: Uuid) -> bool {
        let removed = self.reservations.lock().remove(&id);
        match removed {
            Some(reservation) => {
                self.shards[reservation.shard_id]
                    .bucket
                    .lock()
                    .release_reservation(reservation.count);
                true
            }
            None => false,
        }
    }

    /// Drop expired reservations and release their commitments
    ///
    /// Checked on call paths rather than a timer.
    fn sweep_expired_reservations(&self) {
        let now = Instant::now();
        let expired: Vec<Reservation> = {
            let mut reservations = self.reservations.lock();
            let ids: Vec<Uuid> = reservations
                .iter()
                .filter(|(_, r)| now > r.expires_at)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| reservations.remove(&id))
                .collect()
        };

        for reservation in expired {
            self.shards[reservation.shard_id]
                .bucket
                .lock()
                .release_reservation(reservation.count);
            log::debug!("reservation {} expired unexecuted", reservation.id);
        }
    }

    /// Aggregate status with per-shard snapshots
    pub fn status(&self) -> LimiterStatus {
        let now = Instant::now();
        let shard_details: Vec<ShardSnapshot> = self
            .shards
            .iter()
            .enumerate()
            .map(|(i, shard)| {
                let mut bucket = shard.bucket.lock();
                ShardSnapshot {
                    shard_id: i,
                    tokens: bucket.available(now),
                    capacity: bucket.capacity(),
                    hits: shard.hits.load(Ordering::Relaxed),
                }
            })
            .collect();

        LimiterStatus {
            shards: self.shards.len(),
            allowed: self.allowed.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
            pending_reservations: self.reservations.lock().len(),
            imbalance_ratio: Self::imbalance(&shard_details),
            shard_details,
        }
    }

    /// (max - min) / avg over per-shard hit counts; 0 for a single shard
    fn imbalance(snapshots: &[ShardSnapshot]) -> f64 {
        if snapshots.len() < 2 {
            return 0.0;
        }
        let hits: Vec<u64> = snapshots.iter().map(|s| s.hits).collect();
        let max = *hits.iter().max().unwrap() as f64;
        let min = *hits.iter().min().unwrap() as f64;
        let avg = hits.iter().sum::<u64>() as f64 / hits.len() as f64;
        if avg == 0.0 {
            0.0
        } else {
            (max - min) / avg
        }
    }

    /// Refill every shard, drop reservations, zero counters
    pub fn reset(&self) {
        for shard in &self.shards {
            shard.bucket.lock().reset();
            shard.hits.store(0, Ordering::Relaxed);
        }
        self.reservations.lock().clear();
        self.allowed.store(0, Ordering::Relaxed);
        self.refused.store(0, Ordering::Relaxed);
    }

    /// Rotate the primary hash seed and zero the routing counters
    ///
    /// Existing reservations keep their shard and drain there; only new
    /// requests route under the new seed.
    pub(crate) fn rotate_seed(&self, new_seed: u64) {
        self.seeds[0].store(new_seed, Ordering::Release);
        for shard in &self.shards {
            shard.hits.store(0, Ordering::Relaxed);
        }
        log::info!("rate limiter rebalanced: primary seed rotated");
    }

    /// Per-shard hit counts (adaptive rebalancing input)
    pub(crate) fn shard_hits(&self) -> Vec<u64> {
        self.shards
            .iter()
            .map(|s| s.hits.load(Ordering::Relaxed))
            .collect()
    }

    /// The limiter configuration
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(rate: u64, period_secs: u64, shards: usize, burst: u64) -> ShardedRateLimiter {
        ShardedRateLimiter::new(RateLimiterConfig {
            rate,
            period: Duration::from_secs(period_secs),
            shards: Some(shards),
            burst: Some(burst),
            ..Default::default()
        })
    }

    #[test]
    fn test_optimal_shard_count() {
        assert_eq!(ShardedRateLimiter::optimal_shard_count(10, 8), 1);
        assert_eq!(ShardedRateLimiter::optimal_shard_count(100, 8), 1);
        let s = ShardedRateLimiter::optimal_shard_count(800, 32);
        assert!(s.is_power_of_two() && s >= 2);
        assert!(ShardedRateLimiter::optimal_shard_count(1_000_000, 32) <= 32);
        assert_eq!(ShardedRateLimiter::optimal_shard_count(1_000_000, 8), 8);
    }

    #[test]
    fn test_burst_is_exact_across_shards() {
        // burst 5 over 2 shards splits 3 + 2; exactly 5 grants at t=0
        let limiter = limiter(60, 60, 2, 5);
        let mut allowed = 0;
        for _ in 0..10 {
            if limiter.try_acquire("k", 1).allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 5);
    }

    #[test]
    fn test_refusal_carries_retry_after() {
        let limiter = limiter(1, 60, 1, 1);
        assert!(limiter.try_acquire("k", 1).allowed);
        let refused = limiter.try_acquire("k", 1);
        assert!(!refused.allowed);
        let retry = refused.retry_after.unwrap();
        assert!(retry > Duration::from_secs(50) && retry <= Duration::from_secs(61));
    }

    #[test]
    fn test_reservation_lifecycle() {
        let limiter = limiter(1, 60, 1, 1);
        assert!(limiter.try_acquire("k", 1).allowed);

        // Bucket empty: reservation lands ~60 s out
        let reservation = limiter
            .reserve("k", 1, Duration::from_secs(120))
            .unwrap();
        let wait = reservation.ready_in(Instant::now());
        assert!(wait > Duration::from_secs(55) && wait <= Duration::from_secs(61));

        // Not ready yet
        let err = limiter.execute_reservation(reservation.id).unwrap_err();
        assert!(matches!(err, RateLimitError::ReservationNotReady { .. }));

        // Cancel releases the commitment
        assert!(limiter.cancel_reservation(reservation.id));
        assert!(!limiter.cancel_reservation(reservation.id));
    }

    #[test]
    fn test_reserve_refused_when_max_wait_too_small() {
        let limiter = limiter(1, 60, 1, 1);
        assert!(limiter.try_acquire("k", 1).allowed);
        let err = limiter.reserve("k", 1, Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, RateLimitError::ReservationRefused { .. }));
    }

    #[test]
    fn test_unknown_reservation() {
        let limiter = limiter(10, 1, 1, 10);
        let err = limiter.execute_reservation(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, RateLimitError::ReservationNotFound(_)));
    }

    #[test]
    fn test_immediate_reservation_executes() {
        let limiter = limiter(10, 1, 1, 10);
        let reservation = limiter.reserve("k", 2, Duration::from_secs(1)).unwrap();
        assert_eq!(reservation.ready_in(Instant::now()), Duration::ZERO);

        let result = limiter.execute_reservation(reservation.id).unwrap();
        assert!(result.allowed);
    }

    #[test]
    fn test_status_reports_shards() {
        let limiter = limiter(100, 1, 4, 100);
        for i in 0..50 {
            limiter.try_acquire(&format!("key-{}", i), 1);
        }
        let status = limiter.status();
        assert_eq!(status.shards, 4);
        assert_eq!(status.shard_details.len(), 4);
        assert_eq!(status.allowed + status.refused, 50);
        assert!(status.imbalance_ratio >= 0.0);
    }

    #[test]
    fn test_distribution_across_shards() {
        let limiter = limiter(1000, 1, 4, 1000);
        for i in 0..200 {
            limiter.try_acquire(&format!("key-{}", i), 1);
        }
        let status = limiter.status();
        let used = status.shard_details.iter().filter(|s| s.hits > 0).count();
        assert!(used >= 3, "expected most shards used, got {}", used);
    }

    #[test]
    fn test_reset_restores_capacity() {
        let limiter = limiter(2, 60, 1, 2);
        limiter.try_acquire("k", 2);
        assert!(!limiter.try_acquire("k", 1).allowed);

        limiter.reset();
        assert!(limiter.try_acquire("k", 1).allowed);
        let status = limiter.status();
        assert_eq!(status.allowed, 1);
    }

    #[tokio::test]
    async fn test_blocking_acquire_waits_for_refill() {
        let limiter = ShardedRateLimiter::new(RateLimiterConfig {
            rate: 10,
            period: Duration::from_secs(1),
            shards: Some(1),
            burst: Some(1),
            max_wait: Duration::from_secs(2),
            ..Default::default()
        });

        assert!(limiter.try_acquire("k", 1).allowed);
        let start = Instant::now();
        let result = limiter.acquire("k", 1).await;
        assert!(result.allowed);
        // Refill rate is 10/s, so roughly 100 ms of sleeping
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
