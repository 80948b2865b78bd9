//! # Error Taxonomy
//!
//! Structured error handling for the flashcard pipeline:
//! - Categorized errors (transient, permanent, degraded, system, business)
//! - Severity levels derived from category and condition
//! - Stable fingerprints for grouping identical failures
//! - Context bags enriched as errors propagate upward
//! - Bounded in-memory collection with analytics
//!
//! Errors propagate unchanged between layers: a layer may add context
//! entries but never reclassifies a lower layer's category.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

pub mod analytics;
pub mod collector;

pub use analytics::{ErrorAnalytics, ErrorReport, TrendPoint};
pub use collector::{CollectorConfig, CollectorStats, ErrorCollector};

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

// ============================================================================
// Categories and Severity
// ============================================================================

/// Error category driving recovery policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Network failures, timeouts, 5xx, retryable rate limits
    Transient,
    /// Validation failures, 4xx (except 429)
    Permanent,
    /// A fallback was used; processing continued
    Degraded,
    /// Resource exhaustion (disk, memory, pool)
    System,
    /// Domain invariant violation
    Business,
}

impl ErrorCategory {
    /// Whether the retry coordinator may reattempt this category
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::Transient)
    }

    /// Default severity for the category
    pub fn default_severity(&self) -> Severity {
        match self {
            ErrorCategory::Transient => Severity::Medium,
            ErrorCategory::Permanent => Severity::Medium,
            ErrorCategory::Degraded => Severity::Low,
            ErrorCategory::System => Severity::High,
            ErrorCategory::Business => Severity::Medium,
        }
    }

    /// Stable label used in fingerprints and persisted records
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Degraded => "degraded",
            ErrorCategory::System => "system",
            ErrorCategory::Business => "business",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error severity
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational; no action required
    Low,
    /// Worth noticing in aggregate
    Medium,
    /// Requires attention
    High,
    /// Immediate attention (e.g. authentication failure)
    Critical,
}

impl Severity {
    /// Weight used by the impact score
    pub fn weight(&self) -> u32 {
        match self {
            Severity::Low => 1,
            Severity::Medium => 3,
            Severity::High => 7,
            Severity::Critical => 15,
        }
    }

    /// Stable label used in persisted records
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Error Kinds
// ============================================================================

/// Specific failure type; pairs with a category to form the taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network-level failure (connect, reset, DNS)
    Network,
    /// An explicit timeout elapsed
    Timeout,
    /// External service returned a rate-limit response
    RateLimited,
    /// Rate limiter refused the request locally
    RateLimiterRefused,
    /// A token reservation expired before execution
    ReservationExpired,
    /// A token reservation was executed before its ready time
    ReservationNotReady,
    /// Circuit breaker is open
    CircuitOpen,
    /// Circuit breaker is manually isolated
    CircuitIsolated,
    /// Retry attempts exhausted
    RetryExhausted,
    /// External service rejected the request (4xx)
    ApiRejected,
    /// External service failed (5xx)
    ApiServerError,
    /// Authentication or authorization failure
    AuthFailed,
    /// Response payload could not be parsed
    ParseFailed,
    /// Input validation failure
    Validation,
    /// Cache tier failure
    Cache,
    /// Database driver or SQL failure
    Database,
    /// Database integrity/constraint violation
    ConstraintViolation,
    /// Connection pool acquire timed out
    ConnectionPoolTimeout,
    /// Disk, memory, or descriptor exhaustion
    ResourceExhausted,
    /// Operation cancelled cooperatively
    Cancelled,
    /// Quota budget exhausted
    QuotaExceeded,
    /// Uncategorized internal failure
    Internal,
}

impl ErrorKind {
    /// Stable label used in fingerprints and persisted records
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::RateLimiterRefused => "rate_limiter_refused",
            ErrorKind::ReservationExpired => "reservation_expired",
            ErrorKind::ReservationNotReady => "reservation_not_ready",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::CircuitIsolated => "circuit_isolated",
            ErrorKind::RetryExhausted => "retry_exhausted",
            ErrorKind::ApiRejected => "api_rejected",
            ErrorKind::ApiServerError => "api_server_error",
            ErrorKind::AuthFailed => "auth_failed",
            ErrorKind::ParseFailed => "parse_failed",
            ErrorKind::Validation => "validation",
            ErrorKind::Cache => "cache",
            ErrorKind::Database => "database",
            ErrorKind::ConstraintViolation => "constraint_violation",
            ErrorKind::ConnectionPoolTimeout => "connection_pool_timeout",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// PipelineError
// ============================================================================

/// A categorized pipeline error
///
/// Carries everything the recovery policy and the collector need: kind,
/// category, severity, a recoverable flag, the originating location, a
/// context bag, and an optional retry hint (rate-limit `Retry-After` or
/// a circuit breaker's scheduled recovery time).
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind} ({category}/{severity}): {message}")]
pub struct PipelineError {
    /// Specific failure type
    pub kind: ErrorKind,

    /// Category driving recovery policy
    pub category: ErrorCategory,

    /// Severity level
    pub severity: Severity,

    /// Whether recovery is possible at all
    pub recoverable: bool,

    /// Human-readable message
    pub message: String,

    /// Originating module path (top-of-stack location)
    pub location: &'static str,

    /// Key/value context, enriched as the error propagates
    pub context: BTreeMap<String, String>,

    /// Lower bound on the next retry delay, when the failure carries one
    pub retry_after: Option<Duration>,
}

impl PipelineError {
    /// Create an error with explicit kind and category
    pub fn new(
        kind: ErrorKind,
        category: ErrorCategory,
        message: impl Into<String>,
        location: &'static str,
    ) -> Self {
        let severity = match kind {
            ErrorKind::AuthFailed => Severity::Critical,
            ErrorKind::ResourceExhausted => Severity::High,
            _ => category.default_severity(),
        };
        Self {
            kind,
            category,
            severity,
            recoverable: !matches!(
                category,
                ErrorCategory::Permanent | ErrorCategory::Business
            ),
            message: message.into(),
            location,
            context: BTreeMap::new(),
            retry_after: None,
        }
    }

    /// Transient error (retryable)
    pub fn transient(kind: ErrorKind, message: impl Into<String>, location: &'static str) -> Self {
        Self::new(kind, ErrorCategory::Transient, message, location)
    }

    /// Permanent error (non-retryable)
    pub fn permanent(kind: ErrorKind, message: impl Into<String>, location: &'static str) -> Self {
        Self::new(kind, ErrorCategory::Permanent, message, location)
    }

    /// Degraded-mode event (a fallback was used)
    pub fn degraded(kind: ErrorKind, message: impl Into<String>, location: &'static str) -> Self {
        Self::new(kind, ErrorCategory::Degraded, message, location)
    }

    /// System error (resource exhaustion)
    pub fn system(kind: ErrorKind, message: impl Into<String>, location: &'static str) -> Self {
        Self::new(kind, ErrorCategory::System, message, location)
    }

    /// Business-rule violation
    pub fn business(kind: ErrorKind, message: impl Into<String>, location: &'static str) -> Self {
        Self::new(kind, ErrorCategory::Business, message, location)
    }

    /// Override the derived severity
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Attach a retry hint (used as a lower bound on the next backoff)
    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    /// Add a context entry; layers enrich but never reclassify
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Whether the retry coordinator may reattempt this error
    ///
    /// `CircuitOpen` is transient at the category level but excluded here:
    /// retrying against an open breaker produces retry storms that keep it
    /// open. Callers that want to retry it must opt in via the policy.
    pub fn is_retryable(&self) -> bool {
        self.category.is_retryable()
            && !matches!(
                self.kind,
                ErrorKind::CircuitOpen | ErrorKind::CircuitIsolated | ErrorKind::Cancelled
            )
    }

    /// Stable fingerprint of (category, kind, location, message template)
    ///
    /// The message is normalized first so that instance-specific values
    /// (numbers, quoted strings) group under one fingerprint.
    pub fn fingerprint(&self) -> String {
        fingerprint_parts(
            self.category.as_str(),
            self.kind.as_str(),
            self.location,
            &self.message,
        )
    }

    /// Convert into a record suitable for collection and persistence
    pub fn to_record(&self) -> ErrorRecord {
        ErrorRecord {
            id: uuid::Uuid::new_v4().to_string(),
            fingerprint: self.fingerprint(),
            kind: self.kind,
            category: self.category,
            severity: self.severity,
            recoverable: self.recoverable,
            message: self.message.clone(),
            location: self.location.to_string(),
            timestamp: chrono::Utc::now(),
            context: self.context.clone(),
        }
    }
}

/// Compute a stable fingerprint from error identity parts
pub(crate) fn fingerprint_parts(
    category: &str,
    kind: &str,
    location: &str,
    message: &str,
) -> String {
    let template = normalize_message(message);
    let mut hasher = Sha256::new();
    hasher.update(category.as_bytes());
    hasher.update(b"|");
    hasher.update(kind.as_bytes());
    hasher.update(b"|");
    hasher.update(location.as_bytes());
    hasher.update(b"|");
    hasher.update(template.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

/// Replace instance-specific values in a message with placeholders
fn normalize_message(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    let mut chars = message.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            while chars.peek().is_some_and(|n| n.is_ascii_digit() || *n == '.') {
                chars.next();
            }
            out.push('#');
        } else if c == '\'' || c == '"' {
            while let Some(n) = chars.next() {
                if n == c {
                    break;
                }
            }
            out.push('?');
        } else {
            out.push(c);
        }
    }
    out
}

// ============================================================================
// ErrorRecord
// ============================================================================

/// One captured failure, grouped by fingerprint for aggregation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Unique record id
    pub id: String,

    /// Stable grouping fingerprint
    pub fingerprint: String,

    /// Specific failure type
    pub kind: ErrorKind,

    /// Error category
    pub category: ErrorCategory,

    /// Severity level
    pub severity: Severity,

    /// Whether recovery was possible
    pub recoverable: bool,

    /// Original message
    pub message: String,

    /// Originating module path
    pub location: String,

    /// Capture time
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Context bag at capture time
    pub context: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_retryability() {
        assert!(ErrorCategory::Transient.is_retryable());
        assert!(!ErrorCategory::Permanent.is_retryable());
        assert!(!ErrorCategory::System.is_retryable());
    }

    #[test]
    fn test_circuit_open_not_retryable() {
        let err = PipelineError::transient(ErrorKind::CircuitOpen, "breaker open", "breaker");
        assert_eq!(err.category, ErrorCategory::Transient);
        assert!(!err.is_retryable());

        let err = PipelineError::transient(ErrorKind::Timeout, "request timed out", "llm");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_auth_failure_is_critical() {
        let err = PipelineError::permanent(ErrorKind::AuthFailed, "401 unauthorized", "llm");
        assert_eq!(err.severity, Severity::Critical);
        assert!(!err.recoverable);
    }

    #[test]
    fn test_fingerprint_groups_instances() {
        let a = PipelineError::transient(ErrorKind::Timeout, "timed out after 30s", "llm");
        let b = PipelineError::transient(ErrorKind::Timeout, "timed out after 60s", "llm");
        assert_eq!(a.fingerprint(), b.fingerprint());

        let c = PipelineError::transient(ErrorKind::Network, "timed out after 30s", "llm");
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_fingerprint_strips_quoted_values() {
        let a = PipelineError::permanent(ErrorKind::Validation, "bad term 'apple'", "io");
        let b = PipelineError::permanent(ErrorKind::Validation, "bad term 'pear'", "io");
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_context_enrichment() {
        let err = PipelineError::transient(ErrorKind::Network, "reset", "llm")
            .with_context("stage", "1")
            .with_context("position", "7");
        assert_eq!(err.context.get("stage").map(String::as_str), Some("1"));
        assert_eq!(err.context.len(), 2);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
        assert!(Severity::Critical.weight() > Severity::Low.weight());
    }

    #[test]
    fn test_record_conversion() {
        let err = PipelineError::system(ErrorKind::ResourceExhausted, "disk full", "cache")
            .with_context("path", "/tmp/cache");
        let record = err.to_record();
        assert_eq!(record.fingerprint, err.fingerprint());
        assert_eq!(record.severity, Severity::High);
        assert!(!record.id.is_empty());
    }
}
