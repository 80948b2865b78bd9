//! # LEXIDECK - AI Flashcard Generation Pipeline
//!
//! Turns vocabulary lists into study-ready flashcards through a
//! two-stage LLM pipeline built for external-service rate limits and
//! failure.
//!
//! ## Architecture
//!
//! - `models`: input/output records and the processing outcome sum type
//! - `error`: categorized errors, fingerprinting, collection, analytics
//! - `ratelimit`: sharded token buckets with reservations and adaptive
//!   rebalancing
//! - `breaker`: state-monitored circuit breaker with dynamic break
//!   durations
//! - `retry`: policy-driven backoff composed with the breaker and the
//!   limiter
//! - `cache`: two-tier cache with stampede suppression and tag
//!   invalidation
//! - `database`: pooled SQLite store with transactions and query
//!   analysis
//! - `llm`: the external chat-completions service seam
//! - `pipeline`: bounded-concurrency orchestration with ordered emission
//! - `io`: CSV ingress and TSV egress
//! - `config`: environment-driven configuration, read once

#![warn(missing_docs)]
#![warn(clippy::all)]

// Error taxonomy and collection
pub mod error;

// Data models
pub mod models;

// Sharded rate limiting
pub mod ratelimit;

// Circuit breaker
pub mod breaker;

// Retry coordination
pub mod retry;

// Two-tier caching
pub mod cache;

// Relational store
pub mod database;

// External LLM service
pub mod llm;

// Pipeline orchestration
pub mod pipeline;

// Delimited I/O
pub mod io;

// Configuration
pub mod config;

// Re-export commonly used types
pub use config::PipelineConfig;
pub use error::{ErrorCategory, ErrorKind, PipelineError, Severity};
pub use models::{Flashcard, ProcessingOutcome, ProcessingResult, VocabularyItem};
pub use pipeline::{BatchReport, CancellationToken, Orchestrator, PipelineContext};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
