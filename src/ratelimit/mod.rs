//! # Sharded Rate Limiting
//!
//! Token-bucket rate limiting for the external LLM service:
//! - Per-shard buckets with lazy refill (no background timers)
//! - Two-choice key routing across shards to bound load imbalance
//! - Reservations: future-token grants executed or cancelled by id
//! - Adaptive rebalancing by hash-seed rotation on sustained imbalance
//!
//! Denial is a result, not an error: `acquire`/`try_acquire` report
//! refusal with a `retry_after` estimate. Errors are reserved for
//! reservation misuse (unknown, expired, not ready) and bad configuration.

use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub mod adaptive;
pub mod bucket;
pub mod sharded;

pub use adaptive::AdaptiveRateLimiter;
pub use bucket::{ConsumeOutcome, Reservation, TokenBucketShard};
pub use sharded::{AcquireResult, LimiterStatus, ShardSnapshot, ShardedRateLimiter};

/// Result type for rate limiter operations
pub type Result<T> = std::result::Result<T, RateLimitError>;

/// Rate limiting errors
#[derive(Debug, Error)]
pub enum RateLimitError {
    /// The computed execution time exceeds the caller's patience
    #[error("reservation refused for key '{key}': not satisfiable within {max_wait:?}")]
    ReservationRefused {
        /// Requested key
        key: String,
        /// Caller's maximum wait
        max_wait: Duration,
    },

    /// No reservation with this id
    #[error("reservation {0} not found")]
    ReservationNotFound(Uuid),

    /// The reservation expired before execution
    #[error("reservation {0} expired")]
    ReservationExpired(Uuid),

    /// Executed before its ready time
    #[error("reservation {id} not ready for {ready_in:?}")]
    ReservationNotReady {
        /// Reservation id
        id: Uuid,
        /// Remaining wait
        ready_in: Duration,
    },

    /// Invalid configuration
    #[error("invalid rate limiter configuration: {0}")]
    InvalidConfig(String),
}

/// Rate limiter configuration
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Aggregate tokens per period
    pub rate: u64,

    /// Refill period
    pub period: Duration,

    /// Explicit shard count; computed from `rate` when absent
    pub shards: Option<usize>,

    /// Burst size (bucket capacity); defaults to `rate`
    pub burst: Option<u64>,

    /// Upper bound on computed shard count
    pub max_shards: usize,

    /// Patience of the blocking `acquire`
    pub max_wait: Duration,

    /// Grace period between a reservation's ready and expiry times
    pub reservation_grace: Duration,

    /// Imbalance ratio that triggers an adaptive rotation
    pub rebalance_threshold: f64,

    /// Minimum interval between adaptive rebalance checks
    pub rebalance_interval: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            rate: 600,
            period: Duration::from_secs(60),
            shards: None,
            burst: None,
            max_shards: 32,
            max_wait: Duration::from_secs(30),
            reservation_grace: Duration::from_secs(30),
            rebalance_threshold: 1.0,
            rebalance_interval: Duration::from_secs(10),
        }
    }
}

impl RateLimiterConfig {
    /// Validate configuration bounds
    pub fn validate(&self) -> Result<()> {
        if self.rate == 0 {
            return Err(RateLimitError::InvalidConfig("rate must be positive".into()));
        }
        if self.period.is_zero() {
            return Err(RateLimitError::InvalidConfig("period must be positive".into()));
        }
        if let Some(shards) = self.shards {
            if shards == 0 || shards > 32 {
                return Err(RateLimitError::InvalidConfig(
                    "shards must be in [1, 32]".into(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        assert!(RateLimiterConfig::default().validate().is_ok());

        let bad_rate = RateLimiterConfig { rate: 0, ..Default::default() };
        assert!(bad_rate.validate().is_err());

        let bad_shards = RateLimiterConfig {
            shards: Some(64),
            ..Default::default()
        };
        assert!(bad_shards.validate().is_err());
    }
}
