//! # Circuit Breaker
//!
//! Failure detection and fast-fail for the external LLM service. The
//! breaker executes operations only while its state permits: `closed`
//! passes everything through, `half_open` admits exactly one probe, and
//! `open`/`isolated` fail immediately with the scheduled recovery time.
//!
//! State lives behind one `parking_lot` mutex; the lock is never held
//! across the awaited operation.

use crate::breaker::duration::BreakDurationGenerator;
use crate::breaker::monitor::StateProvider;
use crate::breaker::window::{RollingWindow, WindowCounts};
use crate::breaker::{CircuitBreakerConfig, CircuitState};
use crate::error::{ErrorKind, PipelineError, Result};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Rolling statistics snapshot
#[derive(Debug, Clone, Copy)]
pub struct CircuitStats {
    /// Current state
    pub state: CircuitState,

    /// How long the breaker has been in this state
    pub state_age: Duration,

    /// Calls inside the sampling window
    pub total_calls: u64,

    /// Successful calls inside the window
    pub success_calls: u64,

    /// Failed calls inside the window
    pub failed_calls: u64,

    /// Consecutive failed calls (resets on success)
    pub consecutive_failures: u32,

    /// Consecutive successful calls (resets on failure)
    pub consecutive_successes: u32,

    /// Time until the next probe is admitted, while open
    pub recovery_in: Option<Duration>,
}

/// Mutable breaker core, guarded by one lock
struct BreakerCore {
    state: CircuitState,
    state_entered_at: Instant,
    window: RollingWindow,
    consecutive_failures: u32,
    consecutive_successes: u32,
    /// Consecutive opens without an intervening close; drives the
    /// break-duration generator
    open_streak: u32,
    break_until: Option<Instant>,
    probe_in_flight: bool,
}

/// State-monitored circuit breaker
pub struct CircuitBreaker {
    /// Breaker name for logs and records
    name: String,

    /// Configuration
    config: CircuitBreakerConfig,

    /// Guarded state
    core: Mutex<BreakerCore>,

    /// Observability provider
    provider: Arc<StateProvider>,
}

impl CircuitBreaker {
    /// Create a closed breaker
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let sampling = config.sampling_duration;
        Self {
            name: name.into(),
            config,
            core: Mutex::new(BreakerCore {
                state: CircuitState::Closed,
                state_entered_at: Instant::now(),
                window: RollingWindow::new(sampling),
                consecutive_failures: 0,
                consecutive_successes: 0,
                open_streak: 0,
                break_until: None,
                probe_in_flight: false,
            }),
            provider: Arc::new(StateProvider::new(256)),
        }
    }

    /// Execute `operation` if the state permits
    ///
    /// On refusal the returned `CircuitOpen` error carries the scheduled
    /// recovery time as a retry hint. Outcomes of executed operations are
    /// recorded in the rolling window.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let is_probe = self.begin_call()?;

        let result = operation().await;

        match &result {
            Ok(_) => self.on_success(is_probe),
            Err(error) => self.on_failure(error.kind),
        }

        result
    }

    /// Check admission and transition open->half_open when the break has
    /// elapsed. Returns whether this call is the half-open probe.
    fn begin_call(&self) -> Result<bool> {
        let now = Instant::now();
        let mut core = self.core.lock();

        match core.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Isolated => Err(PipelineError::permanent(
                ErrorKind::CircuitIsolated,
                format!("circuit '{}' is isolated", self.name),
                "breaker",
            )),
            CircuitState::Open => {
                let break_until = core.break_until.unwrap_or(now);
                if now >= break_until {
                    self.transition(&mut core, CircuitState::HalfOpen, "break elapsed");
                    core.probe_in_flight = true;
                    Ok(true)
                } else {
                    Err(self.open_error(break_until - now))
                }
            }
            CircuitState::HalfOpen => {
                if core.probe_in_flight {
                    // Refused as if open while the probe is out
                    let recovery = core.break_until.map(|t| t.saturating_duration_since(now));
                    Err(self.open_error(recovery.unwrap_or(Duration::ZERO)))
                } else {
                    core.probe_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    fn open_error(&self, recovery_in: Duration) -> PipelineError {
        PipelineError::transient(
            ErrorKind::CircuitOpen,
            format!("circuit '{}' is open", self.name),
            "breaker",
        )
        .with_retry_after(recovery_in)
        .with_context("breaker", self.name.clone())
    }

    /// Record a successful call
    fn on_success(&self, is_probe: bool) {
        let now = Instant::now();
        let mut core = self.core.lock();

        core.window.record(true, now);
        core.consecutive_successes += 1;
        core.consecutive_failures = 0;

        if is_probe || core.state == CircuitState::HalfOpen {
            core.probe_in_flight = false;
            core.open_streak = 0;
            core.break_until = None;
            self.transition(&mut core, CircuitState::Closed, "probe succeeded");
        }
    }

    /// Record a failed call and evaluate thresholds
    fn on_failure(&self, kind: ErrorKind) {
        let now = Instant::now();
        let mut core = self.core.lock();

        core.window.record(false, now);
        core.consecutive_failures += 1;
        core.consecutive_successes = 0;
        self.provider.record_error(kind);

        match core.state {
            CircuitState::HalfOpen => {
                core.probe_in_flight = false;
                core.open_streak += 1;
                self.open(&mut core, now, "probe failed");
            }
            CircuitState::Closed => {
                let counts = core.window.counts(now);
                if self.should_open(counts) {
                    core.open_streak = 1;
                    self.open(&mut core, now, "failure threshold exceeded");
                }
            }
            // A failure completing after isolation or re-opening only
            // contributes to the window
            CircuitState::Open | CircuitState::Isolated => {}
        }
    }

    fn should_open(&self, counts: WindowCounts) -> bool {
        counts.total >= self.config.min_throughput
            && counts.failure_rate() >= self.config.failure_threshold
    }

    fn open(&self, core: &mut BreakerCore, now: Instant, reason: &str) {
        let duration = self.config.break_duration_generator.generate(
            self.config.break_duration,
            core.open_streak,
            self.config.min_break,
            self.config.max_break,
        );
        core.break_until = Some(now + duration);
        self.transition(core, CircuitState::Open, reason);
        log::warn!(
            "circuit '{}' opened for {:?} ({})",
            self.name,
            duration,
            reason
        );
    }

    fn transition(&self, core: &mut BreakerCore, to: CircuitState, reason: &str) {
        let from = core.state;
        if from == to {
            return;
        }
        core.state = to;
        core.state_entered_at = Instant::now();
        self.provider.record_transition(from, to, reason);
        log::debug!("circuit '{}': {:?} -> {:?} ({})", self.name, from, to, reason);
    }

    // ========================================================================
    // Manual control
    // ========================================================================

    /// Manually isolate the breaker; every call fails until `reset`
    pub fn isolate(&self, reason: &str) {
        let mut core = self.core.lock();
        core.probe_in_flight = false;
        self.transition(&mut core, CircuitState::Isolated, &format!("manual isolation: {}", reason));
        log::warn!("circuit '{}' manually isolated: {}", self.name, reason);
    }

    /// Manually reset to closed, clearing counters and the window
    pub fn reset(&self) {
        let mut core = self.core.lock();
        core.window.clear();
        core.consecutive_failures = 0;
        core.consecutive_successes = 0;
        core.open_streak = 0;
        core.break_until = None;
        core.probe_in_flight = false;
        self.transition(&mut core, CircuitState::Closed, "manual reset");
    }

    /// Manually move to half-open, admitting one probe immediately
    pub fn force_half_open(&self) {
        let mut core = self.core.lock();
        core.probe_in_flight = false;
        core.break_until = None;
        self.transition(&mut core, CircuitState::HalfOpen, "manual half-open");
    }

    // ========================================================================
    // Observability
    // ========================================================================

    /// Current state
    pub fn state(&self) -> CircuitState {
        self.core.lock().state
    }

    /// Rolling statistics snapshot
    pub fn stats(&self) -> CircuitStats {
        let now = Instant::now();
        let mut core = self.core.lock();
        let counts = core.window.counts(now);
        CircuitStats {
            state: core.state,
            state_age: now.saturating_duration_since(core.state_entered_at),
            total_calls: counts.total,
            success_calls: counts.successes,
            failed_calls: counts.failures,
            consecutive_failures: core.consecutive_failures,
            consecutive_successes: core.consecutive_successes,
            recovery_in: core
                .break_until
                .map(|until| until.saturating_duration_since(now)),
        }
    }

    /// The observability provider
    pub fn provider(&self) -> Arc<StateProvider> {
        self.provider.clone()
    }

    /// Breaker name
    pub fn name(&self) -> &str {
        &self.name
    }
}
