//! # Configuration
//!
//! One `PipelineConfig` read from the environment at startup, composed of
//! each subsystem's section. The core never rereads the environment at
//! runtime; everything flows through the constructed value.
//!
//! Variables use the `LEXIDECK_` prefix; the API credential also honors
//! `OPENROUTER_API_KEY` for compatibility with existing setups.

use crate::breaker::CircuitBreakerConfig;
use crate::cache::CacheConfig;
use crate::database::DatabaseConfig;
use crate::error::{ErrorKind, PipelineError, Result};
use crate::llm::ApiConfig;
use crate::pipeline::PipelineSettings;
use crate::ratelimit::RateLimiterConfig;
use crate::retry::RetryPolicy;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Full pipeline configuration
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    /// External service credentials and endpoint
    pub api: ApiConfig,

    /// Rate limiter section
    pub rate_limit: RateLimiterConfig,

    /// Circuit breaker section
    pub breaker: CircuitBreakerConfig,

    /// Retry section
    pub retry: RetryPolicy,

    /// Cache section
    pub cache: CacheConfig,

    /// Database section
    pub database: DatabaseConfig,

    /// Orchestrator section
    pub pipeline: PipelineSettings,
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env_var(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl PipelineConfig {
    /// Read configuration from the environment, once
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(key) = env_var("LEXIDECK_API_KEY").or_else(|| env_var("OPENROUTER_API_KEY")) {
            config.api.api_key = key;
        }
        if let Some(url) = env_var("LEXIDECK_BASE_URL") {
            config.api.base_url = url;
        }
        if let Some(model) = env_var("LEXIDECK_MODEL") {
            config.api.model = model;
        }
        config.api.timeout =
            Duration::from_secs(env_parse("LEXIDECK_API_TIMEOUT_SECS", 60u64));

        config.rate_limit.rate = env_parse("LEXIDECK_RATE", config.rate_limit.rate);
        config.rate_limit.period =
            Duration::from_secs(env_parse("LEXIDECK_RATE_PERIOD_SECS", 60u64));
        config.rate_limit.max_shards =
            env_parse("LEXIDECK_MAX_SHARDS", config.rate_limit.max_shards);
        if let Some(burst) = env_var("LEXIDECK_BURST").and_then(|v| v.parse().ok()) {
            config.rate_limit.burst = Some(burst);
        }

        if let Some(dir) = env_var("LEXIDECK_CACHE_DIR") {
            config.cache.l2_directory = PathBuf::from(dir);
        }
        config.cache.l2_max_bytes =
            env_parse("LEXIDECK_CACHE_MAX_BYTES", config.cache.l2_max_bytes);

        if let Some(url) = env_var("LEXIDECK_DB_URL") {
            config.database.url = url;
        }
        config.database.min_connections =
            env_parse("LEXIDECK_POOL_MIN", config.database.min_connections);
        config.database.max_connections =
            env_parse("LEXIDECK_POOL_MAX", config.database.max_connections);
        config.database.slow_query_threshold = Duration::from_millis(env_parse(
            "LEXIDECK_SLOW_QUERY_MS",
            config.database.slow_query_threshold.as_millis() as u64,
        ));

        config.pipeline.concurrency =
            env_parse("LEXIDECK_CONCURRENCY", config.pipeline.concurrency);
        config.pipeline.daily_token_budget = env_parse(
            "LEXIDECK_DAILY_TOKEN_BUDGET",
            config.pipeline.daily_token_budget,
        );

        config
    }

    /// Validate the composed configuration
    pub fn validate(&self) -> Result<()> {
        if self.api.api_key.is_empty() {
            return Err(PipelineError::permanent(
                ErrorKind::Validation,
                "API key missing: set LEXIDECK_API_KEY or OPENROUTER_API_KEY",
                "config",
            ));
        }
        self.rate_limit.validate().map_err(|e| {
            PipelineError::permanent(ErrorKind::Validation, e.to_string(), "config")
        })?;
        if self.pipeline.concurrency == 0 {
            return Err(PipelineError::permanent(
                ErrorKind::Validation,
                "concurrency must be positive",
                "config",
            ));
        }
        if self.database.min_connections > self.database.max_connections {
            return Err(PipelineError::permanent(
                ErrorKind::Validation,
                "pool minimum exceeds maximum",
                "config",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_compose() {
        let config = PipelineConfig::default();
        assert_eq!(config.pipeline.concurrency, 20);
        assert!(config.rate_limit.rate > 0);
        // Only the missing API key blocks validation
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[test]
    fn test_validation_passes_with_key() {
        let mut config = PipelineConfig::default();
        config.api.api_key = "sk-test".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pool_bounds_checked() {
        let mut config = PipelineConfig::default();
        config.api.api_key = "sk-test".into();
        config.database.min_connections = 50;
        config.database.max_connections = 10;
        assert!(config.validate().is_err());
    }
}
