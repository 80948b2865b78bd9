//! # Token Bucket Shard
//!
//! One independent bucket within the sharded rate limiter. Refill is lazy:
//! every observation advances the token level from the elapsed time, so no
//! background timer is needed. Reservations commit future tokens without
//! ever driving the observable level below zero.

use std::time::{Duration, Instant};
use uuid::Uuid;

/// Outcome of a consume attempt on a single shard
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsumeOutcome {
    /// Whether the tokens were granted
    pub allowed: bool,

    /// Token level after the attempt
    pub tokens_remaining: f64,

    /// Time until the requested count would be available, when refused
    pub retry_after: Option<Duration>,
}

/// A future-token grant, single-use
///
/// Executing or cancelling a reservation removes it. The committed tokens
/// are invisible to `try_consume` until then, so concurrent callers cannot
/// steal them.
#[derive(Debug, Clone)]
pub struct Reservation {
    /// Opaque reservation id
    pub id: Uuid,

    /// Key the reservation was made for
    pub key: String,

    /// Committed token count
    pub count: f64,

    /// Earliest execution time
    pub execute_at: Instant,

    /// Expiration; `execute_at <= expires_at`
    pub expires_at: Instant,

    /// Shard holding the commitment
    pub shard_id: usize,
}

impl Reservation {
    /// Delay from `now` until the reservation becomes executable
    pub fn ready_in(&self, now: Instant) -> Duration {
        self.execute_at.saturating_duration_since(now)
    }
}

/// Per-shard token bucket state
///
/// Invariants on every observation: `0 <= tokens <= capacity` and
/// `0 <= committed <= capacity`. The level available to consumers is
/// `tokens - committed`.
#[derive(Debug)]
pub struct TokenBucketShard {
    /// Maximum tokens (burst size)
    capacity: f64,

    /// Current token level
    tokens: f64,

    /// Tokens committed to outstanding reservations
    committed: f64,

    /// Refill rate in tokens per second
    refill_rate: f64,

    /// Last lazy-refill observation
    last_refill: Instant,
}

impl TokenBucketShard {
    /// Create a full bucket
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            tokens: capacity,
            committed: 0.0,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    /// Advance the token level from elapsed time
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Tokens available to consumers right now
    pub fn available(&mut self, now: Instant) -> f64 {
        self.refill(now);
        (self.tokens - self.committed).max(0.0)
    }

    /// Attempt to consume `count` tokens
    pub fn try_consume(&mut self, count: f64, now: Instant) -> ConsumeOutcome {
        self.refill(now);
        let available = self.tokens - self.committed;

        if available >= count {
            self.tokens -= count;
            ConsumeOutcome {
                allowed: true,
                tokens_remaining: self.tokens - self.committed,
                retry_after: None,
            }
        } else {
            let deficit = count - available;
            let retry_after = if self.refill_rate > 0.0 {
                Duration::from_secs_f64(deficit / self.refill_rate)
            } else {
                Duration::MAX
            };
            ConsumeOutcome {
                allowed: false,
                tokens_remaining: available.max(0.0),
                retry_after: Some(retry_after),
            }
        }
    }

    /// Compute the time at which `count` tokens would be available and
    /// commit them, or refuse when the wait exceeds `max_wait`
    pub fn reserve(
        &mut self,
        key: &str,
        count: f64,
        max_wait: Duration,
        grace: Duration,
        shard_id: usize,
        now: Instant,
    ) -> Option<Reservation> {
        self.refill(now);
        let available = self.tokens - self.committed;

        let wait = if available >= count {
            Duration::ZERO
        } else if self.refill_rate > 0.0 {
            Duration::from_secs_f64((count - available) / self.refill_rate)
        } else {
            return None;
        };

        if wait > max_wait {
            return None;
        }

        self.committed += count;
        let execute_at = now + wait;
        Some(Reservation {
            id: Uuid::new_v4(),
            key: key.to_string(),
            count,
            execute_at,
            expires_at: execute_at + grace,
            shard_id,
        })
    }

    /// Consume the tokens a reservation committed
    ///
    /// The caller has already validated readiness and expiry; the shard
    /// releases the commitment and decrements the level.
    pub fn execute_reservation(&mut self, count: f64, now: Instant) -> ConsumeOutcome {
        self.refill(now);
        self.committed = (self.committed - count).max(0.0);
        self.tokens = (self.tokens - count).max(0.0);
        ConsumeOutcome {
            allowed: true,
            tokens_remaining: (self.tokens - self.committed).max(0.0),
            retry_after: None,
        }
    }

    /// Release a commitment without consuming (cancel or expiry)
    pub fn release_reservation(&mut self, count: f64) {
        self.committed = (self.committed - count).max(0.0);
    }

    /// Refill the bucket to capacity and drop commitments
    pub fn reset(&mut self) {
        self.tokens = self.capacity;
        self.committed = 0.0;
        self.last_refill = Instant::now();
    }

    /// Bucket capacity
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Raw token level at the last observation
    pub fn tokens(&self) -> f64 {
        self.tokens
    }
}
