//! # Pipeline Context
//!
//! All shared components, constructed once and passed explicitly: rate
//! limiter, circuit breaker, retry coordinator, cache service, query
//! executor, error collector, and the LLM service. No module-level
//! singletons; the only process-wide state is what the relational store
//! persists.

use crate::breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::cache::{CacheConfig, CacheService};
use crate::database::{ConnectionPool, DatabaseConfig, MigrationRunner, QueryExecutor};
use crate::error::{ErrorCollector, ErrorKind, PipelineError};
use crate::llm::LlmService;
use crate::pipeline::PipelineSettings;
use crate::ratelimit::{AdaptiveRateLimiter, RateLimiterConfig};
use crate::retry::{RetryCoordinator, RetryPolicy};
use std::sync::Arc;

/// Shared components for one process
pub struct PipelineContext {
    /// External LLM service
    pub llm: Arc<dyn LlmService>,

    /// Sharded rate limiter with adaptive rebalancing
    pub limiter: Arc<AdaptiveRateLimiter>,

    /// Circuit breaker guarding the LLM service
    pub breaker: Arc<CircuitBreaker>,

    /// Retry coordinator
    pub retry: Arc<RetryCoordinator>,

    /// Two-tier cache
    pub cache: Arc<CacheService>,

    /// Relational store executor
    pub executor: Arc<QueryExecutor>,

    /// Error collector
    pub errors: Arc<ErrorCollector>,

    /// Pipeline settings
    pub settings: PipelineSettings,
}

impl PipelineContext {
    /// Construct every component and run schema migrations
    pub async fn build(
        llm: Arc<dyn LlmService>,
        limiter_config: RateLimiterConfig,
        breaker_config: CircuitBreakerConfig,
        retry_policy: RetryPolicy,
        cache_config: CacheConfig,
        database_config: DatabaseConfig,
        settings: PipelineSettings,
    ) -> crate::error::Result<Arc<Self>> {
        limiter_config.validate().map_err(|e| {
            PipelineError::permanent(ErrorKind::Validation, e.to_string(), "pipeline")
        })?;

        let cache = CacheService::new(cache_config).await.map_err(|e| {
            PipelineError::system(ErrorKind::Cache, e.to_string(), "pipeline")
        })?;

        let pool = ConnectionPool::new(database_config.clone()).await?;
        let executor = Arc::new(QueryExecutor::new(pool, &database_config));
        MigrationRunner::run(&executor).await?;

        Ok(Arc::new(Self {
            llm,
            limiter: Arc::new(AdaptiveRateLimiter::new(limiter_config)),
            breaker: Arc::new(CircuitBreaker::new("llm", breaker_config)),
            retry: Arc::new(RetryCoordinator::new(retry_policy)),
            cache,
            executor,
            errors: ErrorCollector::with_defaults(),
            settings,
        }))
    }
}
