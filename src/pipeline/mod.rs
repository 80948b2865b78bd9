//! # Pipeline Orchestration
//!
//! Drives a batch of vocabulary items through the two-stage LLM
//! composition with bounded concurrency, emitting results in input order:
//! - A semaphore of capacity `C` gates worker entry
//! - Each item flows cache -> rate limiter -> breaker + retry -> cache
//! - The ordered collector emits results by position regardless of
//!   completion order
//! - Cancellation is cooperative; workers observe the signal at
//!   suspension points
//! - A `system`-category failure flips the batch into drain mode: no new
//!   workers start, collected results are emitted

use crate::error::ErrorCategory;
use crate::models::{ProcessingResult, TokenUsage};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

pub mod collector;
pub mod context;
pub mod orchestrator;
pub mod progress;

pub use collector::OrderedCollector;
pub use context::PipelineContext;
pub use orchestrator::Orchestrator;
pub use progress::{ProgressCallback, ProgressReporter, ProgressSnapshot};

/// Pipeline settings
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Concurrent workers
    pub concurrency: usize,

    /// TTL for cached stage results; `None` keeps them indefinitely
    pub stage_cache_ttl: Option<Duration>,

    /// How long a worker waits out circuit-breaker recovery before
    /// giving an item up
    pub stage_patience: Duration,

    /// Minimum interval between progress callbacks
    pub progress_interval: Duration,

    /// Daily token budget; zero disables the quota guard
    pub daily_token_budget: u64,

    /// Cost per token for usage accounting
    pub cost_per_token: f64,

    /// Mirror cache metadata into the store after each batch
    pub mirror_cache_metadata: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            concurrency: 20,
            stage_cache_ttl: None,
            stage_patience: Duration::from_secs(120),
            progress_interval: Duration::from_millis(100),
            daily_token_budget: 0,
            cost_per_token: 0.000_003,
            mirror_cache_metadata: true,
        }
    }
}

// ============================================================================
// Cancellation
// ============================================================================

/// Batch-scoped cooperative cancellation signal
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    /// Create an uncancelled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation; idempotent
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Whether cancellation was signalled
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// Wait until cancellation is signalled
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

// ============================================================================
// Batch report
// ============================================================================

/// Outcome of one processed batch
#[derive(Debug)]
pub struct BatchReport {
    /// Ordered results, one per input item
    pub results: Vec<ProcessingResult>,

    /// Items that produced flashcards (fresh or cached)
    pub succeeded: usize,

    /// Items served entirely from cache
    pub cached: usize,

    /// Items that failed
    pub failed: usize,

    /// Failure counts by category
    pub failures_by_category: HashMap<ErrorCategory, u64>,

    /// Representative fingerprints for the terminal summary
    pub failure_fingerprints: Vec<String>,

    /// Token usage across the batch
    pub tokens: TokenUsage,

    /// Estimated cost of the batch
    pub estimated_cost: f64,

    /// Wall time
    pub elapsed: Duration,

    /// Whether the batch was cancelled
    pub cancelled: bool,

    /// Whether drain mode engaged
    pub drained: bool,
}

impl BatchReport {
    /// Process exit code: 0 success, 2 external-service failures,
    /// 3 internal failures, 130 cancelled
    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            return 130;
        }
        if self.failed == 0 {
            return 0;
        }
        let count = |category: ErrorCategory| {
            self.failures_by_category.get(&category).copied().unwrap_or(0)
        };
        if count(ErrorCategory::System) > 0 || count(ErrorCategory::Business) > 0 {
            3
        } else if count(ErrorCategory::Transient) > 0 || count(ErrorCategory::Permanent) > 0 {
            2
        } else {
            3
        }
    }
}
