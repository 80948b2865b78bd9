//! # Relational Store
//!
//! File-backed SQLite persistence for the pipeline:
//! - Hand-built async connection pooling with health checks and idle
//!   eviction
//! - Query execution with transactions, savepoints, prepared-statement
//!   reuse, a TTL read cache, and slow-query logging
//! - Query pattern analysis (normalization, N+1 detection, index
//!   suggestions)
//! - Embedded schema migrations
//!
//! Driver failures are classified into the pipeline's error taxonomy:
//! lock contention and connection loss are transient; constraint and
//! syntax failures are permanent.

use crate::error::{ErrorCategory, ErrorKind, PipelineError};
use std::time::Duration;
use thiserror::Error;

pub mod executor;
pub mod optimizer;
pub mod pool;
pub mod schema;

pub use executor::{
    ExecutorStats, PreparedHandle, QueryExecutor, QueryResult, Row, SlowQuery, SqlValue,
    TransactionScope,
};
pub use optimizer::{
    fingerprint, normalize, IndexSuggestion, NPlusOneFinding, OptimizationReport, QueryOptimizer,
};
pub use pool::{
    ConnectionPool, ConnectionState, ConnectionStats, HealthCheckResult, PoolGuard, PoolStats,
    PooledConnection,
};
pub use schema::{Migration, MigrationRunner, MIGRATIONS};

/// Result type for database operations
pub type Result<T> = std::result::Result<T, DatabaseError>;

/// Database error types
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Connection pool failure
    #[error("connection pool error: {0}")]
    ConnectionPool(String),

    /// Acquire timed out; carries pool state for the error context
    #[error("connection pool acquire timed out after {waited:?} (size {size}, idle {idle})")]
    PoolTimeout {
        /// How long the caller waited
        waited: Duration,
        /// Pool size at timeout
        size: u32,
        /// Idle connections at timeout
        idle: usize,
    },

    /// Query execution failure (syntax, schema, unclassified driver)
    #[error("query execution error: {0}")]
    QueryExecution(String),

    /// Integrity violation; carries the constraint name
    #[error("constraint violation ({constraint}): {message}")]
    Constraint {
        /// Violated constraint
        constraint: String,
        /// Driver message
        message: String,
    },

    /// Lock contention; retryable
    #[error("database busy: {0}")]
    Busy(String),

    /// Transaction control failure
    #[error("transaction error: {0}")]
    Transaction(String),

    /// Migration failure
    #[error("migration error: {0}")]
    Migration(String),
}

impl DatabaseError {
    /// Map into the pipeline taxonomy without losing the driver detail
    pub fn to_pipeline_error(&self) -> PipelineError {
        let (kind, category) = match self {
            DatabaseError::ConnectionPool(_) => (ErrorKind::Database, ErrorCategory::Transient),
            DatabaseError::PoolTimeout { .. } => {
                (ErrorKind::ConnectionPoolTimeout, ErrorCategory::Transient)
            }
            DatabaseError::Busy(_) => (ErrorKind::Database, ErrorCategory::Transient),
            DatabaseError::Constraint { .. } => {
                (ErrorKind::ConstraintViolation, ErrorCategory::Permanent)
            }
            DatabaseError::QueryExecution(_) => (ErrorKind::Database, ErrorCategory::Permanent),
            DatabaseError::Transaction(_) => (ErrorKind::Database, ErrorCategory::Transient),
            DatabaseError::Migration(_) => (ErrorKind::Database, ErrorCategory::System),
        };

        let mut error = PipelineError::new(kind, category, self.to_string(), "database");
        if let DatabaseError::Constraint { constraint, .. } = self {
            error = error.with_context("constraint", constraint.clone());
        }
        if let DatabaseError::PoolTimeout { size, idle, .. } = self {
            error = error
                .with_context("pool_size", size.to_string())
                .with_context("pool_idle", idle.to_string());
        }
        error
    }
}

impl From<DatabaseError> for PipelineError {
    fn from(error: DatabaseError) -> Self {
        error.to_pipeline_error()
    }
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Database URL (e.g. `sqlite://lexideck.db`)
    pub url: String,

    /// Minimum pooled connections
    pub min_connections: u32,

    /// Maximum pooled connections
    pub max_connections: u32,

    /// Acquire patience
    pub acquire_timeout: Duration,

    /// Idle time before a connection is evicted (above the minimum)
    pub idle_timeout: Duration,

    /// Interval of the background health/eviction task
    pub health_check_interval: Duration,

    /// Prepared-statement LRU capacity
    pub statement_cache_capacity: usize,

    /// Read-cache TTL; zero disables read caching
    pub query_cache_ttl: Duration,

    /// Slow-query threshold
    pub slow_query_threshold: Duration,

    /// Structurally-identical repeats that flag an N+1 pattern
    pub n_plus_one_threshold: usize,

    /// Enable WAL mode
    pub enable_wal: bool,

    /// SQLite busy timeout in milliseconds
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://lexideck.db".to_string(),
            min_connections: 2,
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            health_check_interval: Duration::from_secs(60),
            statement_cache_capacity: 128,
            query_cache_ttl: Duration::from_secs(5),
            slow_query_threshold: Duration::from_millis(500),
            n_plus_one_threshold: 5,
            enable_wal: true,
            busy_timeout_ms: 5000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let busy = DatabaseError::Busy("database is locked".into());
        assert_eq!(busy.to_pipeline_error().category, ErrorCategory::Transient);
        assert!(busy.to_pipeline_error().is_retryable());

        let constraint = DatabaseError::Constraint {
            constraint: "vocabulary.position".into(),
            message: "UNIQUE constraint failed: vocabulary.position".into(),
        };
        let err = constraint.to_pipeline_error();
        assert_eq!(err.category, ErrorCategory::Permanent);
        assert_eq!(
            err.context.get("constraint").map(String::as_str),
            Some("vocabulary.position")
        );

        let timeout = DatabaseError::PoolTimeout {
            waited: Duration::from_millis(200),
            size: 5,
            idle: 0,
        };
        let err = timeout.to_pipeline_error();
        assert_eq!(err.kind, ErrorKind::ConnectionPoolTimeout);
        assert_eq!(err.context.get("pool_size").map(String::as_str), Some("5"));
    }

    #[test]
    fn test_default_config() {
        let config = DatabaseConfig::default();
        assert!(config.min_connections <= config.max_connections);
        assert!(config.enable_wal);
    }
}
