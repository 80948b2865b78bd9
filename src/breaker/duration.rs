//! # Break Duration Generators
//!
//! Maps the consecutive-failure count to the time the breaker stays open.
//! Every generator's output is clamped to `[min_break, max_break]`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Strategy for computing the open-state duration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "strategy")]
pub enum BreakDurationGenerator {
    /// Constant duration regardless of failure count
    Fixed,

    /// Base duration multiplied by the failure count
    Linear,

    /// Base duration times 1.5^(failures - 1)
    Exponential,

    /// Gentle slope up to 3 failures, steeper slope beyond,
    /// saturating at 10
    Adaptive,
}

impl BreakDurationGenerator {
    /// Exponential growth base
    pub const EXPONENTIAL_BASE: f64 = 1.5;

    /// Compute the break duration for a consecutive-failure count
    pub fn generate(
        &self,
        base: Duration,
        consecutive_failures: u32,
        min_break: Duration,
        max_break: Duration,
    ) -> Duration {
        let failures = consecutive_failures.max(1);
        let base_secs = base.as_secs_f64();

        let raw = match self {
            BreakDurationGenerator::Fixed => base_secs,
            BreakDurationGenerator::Linear => base_secs * failures as f64,
            BreakDurationGenerator::Exponential => {
                base_secs * Self::EXPONENTIAL_BASE.powi(failures as i32 - 1)
            }
            BreakDurationGenerator::Adaptive => {
                // Piecewise: linear through 3 failures, then 1.5x per
                // additional failure, flat after 10
                let capped = failures.min(10);
                if capped <= 3 {
                    base_secs * capped as f64
                } else {
                    base_secs * 3.0 * Self::EXPONENTIAL_BASE.powi(capped as i32 - 3)
                }
            }
        };

        Duration::from_secs_f64(raw.clamp(min_break.as_secs_f64(), max_break.as_secs_f64()))
    }
}

impl Default for BreakDurationGenerator {
    fn default() -> Self {
        BreakDurationGenerator::Exponential
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: Duration = Duration::from_millis(100);
    const MAX: Duration = Duration::from_secs(300);

    #[test]
    fn test_fixed_ignores_failures() {
        let base = Duration::from_secs(30);
        let generator = BreakDurationGenerator::Fixed;
        assert_eq!(generator.generate(base, 1, MIN, MAX), base);
        assert_eq!(generator.generate(base, 7, MIN, MAX), base);
    }

    #[test]
    fn test_linear_scales() {
        let base = Duration::from_secs(10);
        let generator = BreakDurationGenerator::Linear;
        assert_eq!(generator.generate(base, 3, MIN, MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_exponential_growth() {
        let base = Duration::from_secs(1);
        let generator = BreakDurationGenerator::Exponential;
        assert_eq!(generator.generate(base, 1, MIN, MAX), Duration::from_secs(1));

        let second = generator.generate(base, 2, MIN, MAX);
        assert_eq!(second, Duration::from_secs_f64(1.5));
    }

    #[test]
    fn test_clamped_to_max() {
        let base = Duration::from_secs(60);
        let generator = BreakDurationGenerator::Exponential;
        let long = generator.generate(base, 20, MIN, MAX);
        assert_eq!(long, MAX);
    }

    #[test]
    fn test_adaptive_switches_slope() {
        let base = Duration::from_secs(1);
        let generator = BreakDurationGenerator::Adaptive;

        assert_eq!(generator.generate(base, 2, MIN, MAX), Duration::from_secs(2));
        assert_eq!(generator.generate(base, 3, MIN, MAX), Duration::from_secs(3));

        let fourth = generator.generate(base, 4, MIN, MAX);
        assert_eq!(fourth, Duration::from_secs_f64(4.5));

        // Saturates at 10 failures
        assert_eq!(
            generator.generate(base, 10, MIN, MAX),
            generator.generate(base, 50, MIN, MAX)
        );
    }

    #[test]
    fn test_zero_failures_treated_as_one() {
        let base = Duration::from_secs(5);
        let generator = BreakDurationGenerator::Linear;
        assert_eq!(generator.generate(base, 0, MIN, MAX), Duration::from_secs(5));
    }
}
