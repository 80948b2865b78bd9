//! # Retry Coordination
//!
//! Policy-driven retry with exponential backoff and jitter, aware of the
//! error taxonomy and composable with the circuit breaker and the rate
//! limiter:
//! - `CircuitOpen` is non-retryable unless the policy opts in; retrying
//!   against an open breaker only keeps it open
//! - Rate-limit retry hints are honored as a lower bound on the next
//!   sleep, capped at `max_delay`

use crate::error::{ErrorKind, PipelineError, Result};
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Predicate deciding whether an error at a given attempt is retried
pub type RetryPredicate = Arc<dyn Fn(&PipelineError, u32) -> bool + Send + Sync>;

/// Retry policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first
    pub max_attempts: u32,

    /// Delay before the second attempt
    pub initial_delay: Duration,

    /// Upper bound on any single delay
    pub max_delay: Duration,

    /// Backoff growth factor
    pub exponential_base: f64,

    /// Jitter as a fraction of the delay, in [0, 1]
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            exponential_base: 2.0,
            jitter_fraction: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Backoff for attempt `i` (1-based), before jitter and hints
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let raw = self.initial_delay.as_secs_f64() * self.exponential_base.powi(exponent);
        Duration::from_secs_f64(raw.min(self.max_delay.as_secs_f64()))
    }
}

/// Retry coordinator
pub struct RetryCoordinator {
    /// Policy in effect
    policy: RetryPolicy,

    /// Retryability predicate
    retry_on: RetryPredicate,
}

impl RetryCoordinator {
    /// Coordinator with the default predicate: retry transient errors,
    /// excluding `CircuitOpen`
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            retry_on: Arc::new(|error, _attempt| error.is_retryable()),
        }
    }

    /// Coordinator with a custom predicate
    pub fn with_predicate(policy: RetryPolicy, retry_on: RetryPredicate) -> Self {
        Self { policy, retry_on }
    }

    /// The policy in effect
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` up to `max_attempts` times
    ///
    /// Between attempts the coordinator sleeps the jittered backoff, or
    /// the error's retry hint when that is larger (capped at `max_delay`).
    /// Exhaustion returns a `RetryExhausted` error wrapping the last
    /// failure without reclassifying its category.
    pub async fn retry<T, F, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_error: Option<PipelineError> = None;

        for attempt in 1..=self.policy.max_attempts {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    let retryable =
                        attempt < self.policy.max_attempts && (self.retry_on)(&error, attempt);

                    if !retryable {
                        if attempt < self.policy.max_attempts {
                            // Predicate refused: surface the error as-is
                            return Err(error);
                        }
                        last_error = Some(error);
                        break;
                    }

                    let delay = self.next_delay(attempt, &error);
                    log::debug!(
                        "attempt {}/{} failed ({}); retrying in {:?}",
                        attempt,
                        self.policy.max_attempts,
                        error.kind,
                        delay
                    );
                    last_error = Some(error);
                    tokio::time::sleep(delay).await;
                }
            }
        }

        let last = last_error.expect("at least one attempt");
        Err(self.exhausted(last))
    }

    /// Jittered backoff for the next sleep, floored by the retry hint
    fn next_delay(&self, attempt: u32, error: &PipelineError) -> Duration {
        let mut delay = self.policy.backoff(attempt);

        // A hint from the service is a lower bound, but never above the cap
        if let Some(hint) = error.retry_after {
            let capped_hint = hint.min(self.policy.max_delay);
            delay = delay.max(capped_hint);
        }

        if self.policy.jitter_fraction > 0.0 {
            let jitter = self.policy.jitter_fraction.clamp(0.0, 1.0);
            let factor = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
            delay = Duration::from_secs_f64(delay.as_secs_f64() * factor);
        }

        delay.min(self.policy.max_delay)
    }

    fn exhausted(&self, last: PipelineError) -> PipelineError {
        let mut error = PipelineError::new(
            ErrorKind::RetryExhausted,
            last.category,
            format!(
                "retries exhausted after {} attempts: {}",
                self.policy.max_attempts, last.message
            ),
            "retry",
        )
        .with_context("attempts", self.policy.max_attempts.to_string())
        .with_context("last_kind", last.kind.to_string());
        for (key, value) in last.context {
            error.context.entry(key).or_insert(value);
        }
        error
    }
}
