//! # Circuit Breaker
//!
//! Prevents cascading failures against the external LLM service:
//! 1. **Closed**: normal operation, calls pass through
//! 2. **Open**: too many failures, calls fail fast with a recovery time
//! 3. **Half-Open**: exactly one probe tests recovery
//! 4. **Isolated**: manually removed from service
//!
//! Break duration is dynamic: a configurable generator maps consecutive
//! opens to the time spent open, bounded to `[min_break, max_break]`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod circuit;
pub mod duration;
pub mod monitor;
pub mod window;

pub use circuit::{CircuitBreaker, CircuitStats};
pub use duration::BreakDurationGenerator;
pub use monitor::{StateProvider, StateTransition};
pub use window::{RollingWindow, WindowCounts};

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Failing fast
    Open,
    /// Testing recovery with a single probe
    HalfOpen,
    /// Manually removed from service
    Isolated,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failure rate in [0, 1] that opens the circuit
    pub failure_threshold: f64,

    /// Minimum calls in the window before the threshold applies
    pub min_throughput: u64,

    /// Rolling window length for failure tracking
    pub sampling_duration: Duration,

    /// Base break duration fed to the generator
    pub break_duration: Duration,

    /// Strategy mapping consecutive opens to break duration
    pub break_duration_generator: BreakDurationGenerator,

    /// Lower clamp on generated break durations
    pub min_break: Duration,

    /// Upper clamp on generated break durations
    pub max_break: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 0.5,
            min_throughput: 4,
            sampling_duration: Duration::from_secs(60),
            break_duration: Duration::from_secs(30),
            break_duration_generator: BreakDurationGenerator::default(),
            min_break: Duration::from_secs(1),
            max_break: Duration::from_secs(300),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_sane() {
        let config = CircuitBreakerConfig::default();
        assert!(config.failure_threshold > 0.0 && config.failure_threshold <= 1.0);
        assert!(config.min_break <= config.max_break);
        assert_eq!(
            config.break_duration_generator,
            BreakDurationGenerator::Exponential
        );
    }
}
