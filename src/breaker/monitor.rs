//! # Breaker State Provider
//!
//! Observability for the circuit breaker: a bounded timeline of state
//! transitions and an error breakdown by kind. The provider never blocks
//! the call path for long; everything is behind short critical sections.

use crate::breaker::CircuitState;
use crate::error::ErrorKind;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};

/// One recorded state transition
#[derive(Debug, Clone)]
pub struct StateTransition {
    /// Previous state
    pub from: CircuitState,

    /// New state
    pub to: CircuitState,

    /// When the transition happened
    pub at: DateTime<Utc>,

    /// Why it happened
    pub reason: String,
}

/// Bounded transition timeline plus error breakdown
pub struct StateProvider {
    /// Recent transitions, oldest first
    timeline: RwLock<VecDeque<StateTransition>>,

    /// Failure counts by error kind
    error_breakdown: RwLock<HashMap<ErrorKind, u64>>,

    /// Maximum timeline entries retained
    capacity: usize,
}

impl StateProvider {
    /// Create a provider retaining up to `capacity` transitions
    pub fn new(capacity: usize) -> Self {
        Self {
            timeline: RwLock::new(VecDeque::with_capacity(capacity.min(256))),
            error_breakdown: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Record a state transition
    pub fn record_transition(&self, from: CircuitState, to: CircuitState, reason: impl Into<String>) {
        let transition = StateTransition {
            from,
            to,
            at: Utc::now(),
            reason: reason.into(),
        };
        let mut timeline = self.timeline.write();
        if timeline.len() >= self.capacity {
            timeline.pop_front();
        }
        timeline.push_back(transition);
    }

    /// Record a failure kind for the breakdown
    pub fn record_error(&self, kind: ErrorKind) {
        *self.error_breakdown.write().entry(kind).or_insert(0) += 1;
    }

    /// Transitions within the last `window`
    pub fn timeline(&self, window: chrono::Duration) -> Vec<StateTransition> {
        let cutoff = Utc::now() - window;
        self.timeline
            .read()
            .iter()
            .filter(|t| t.at >= cutoff)
            .cloned()
            .collect()
    }

    /// Full retained timeline
    pub fn full_timeline(&self) -> Vec<StateTransition> {
        self.timeline.read().iter().cloned().collect()
    }

    /// Failure counts by error kind
    pub fn error_breakdown(&self) -> HashMap<ErrorKind, u64> {
        self.error_breakdown.read().clone()
    }

    /// Drop all recorded history
    pub fn clear(&self) {
        self.timeline.write().clear();
        self.error_breakdown.write().clear();
    }
}
