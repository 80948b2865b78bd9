//! # Two-Tier Caching
//!
//! Caching for LLM stage results:
//! - L1: bounded in-memory tier with LRU/LFU/FIFO/TTL eviction
//! - L2: compressed on-disk tier with atomic writes and a size-capped
//!   sweeper
//! - Coordinator: tiered lookup with promotion, stampede suppression,
//!   tag invalidation, refresh-ahead, and batch warming
//!
//! Values are bincode-encoded; disk entries above a size threshold are
//! gzip-compressed. Entries hit five times become hot and survive
//! eviction until byte pressure turns critical.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub mod disk;
pub mod entry;
pub mod memory;
pub mod service;

pub use disk::{DiskTier, DiskTierStats};
pub use entry::{key_fingerprint, CacheEntry, CacheTier, EvictionPolicy, TagIndex, HOT_THRESHOLD};
pub use memory::{MemoryTier, MemoryTierStats};
pub use service::{CacheLookup, CacheMetadataRow, CacheService};

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Cache errors
#[derive(Debug, Error)]
pub enum CacheError {
    /// Disk tier I/O failure
    #[error("cache I/O error: {0}")]
    Io(String),

    /// Value encoding/decoding failure
    #[error("cache serialization error: {0}")]
    Serialization(String),

    /// Compression or decompression failure
    #[error("cache compression error: {0}")]
    Compression(String),
}

/// Write propagation mode for the disk tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// L2 write happens asynchronously after the L1 write (default)
    WriteBehind,

    /// L2 write completes before `set` returns
    WriteThrough,
}

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// L1 entry budget
    pub max_entries: usize,

    /// L1 byte budget
    pub max_bytes: usize,

    /// Eviction policy for both tiers
    pub policy: EvictionPolicy,

    /// Whether the disk tier is enabled
    pub enable_l2: bool,

    /// Disk tier root directory
    pub l2_directory: PathBuf,

    /// Disk tier size budget
    pub l2_max_bytes: u64,

    /// Values at or above this size are compressed on disk
    pub compression_threshold: usize,

    /// How L2 writes propagate
    pub write_mode: WriteMode,

    /// TTL applied when callers pass none
    pub default_ttl: Option<Duration>,

    /// Interval between L2 sweeps
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_bytes: 64 * 1024 * 1024,
            policy: EvictionPolicy::Lru,
            enable_l2: true,
            l2_directory: PathBuf::from(".lexideck/cache"),
            l2_max_bytes: 1024 * 1024 * 1024,
            compression_threshold: 1024,
            write_mode: WriteMode::WriteBehind,
            default_ttl: None,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Combined statistics across tiers and the coordinator
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheServiceStats {
    /// L1 entry count
    pub l1_entries: usize,

    /// L1 byte total
    pub l1_bytes: usize,

    /// L1 hits
    pub l1_hits: u64,

    /// L1 misses
    pub l1_misses: u64,

    /// L1 evictions
    pub l1_evictions: u64,

    /// L2 hits
    pub l2_hits: u64,

    /// L2 misses
    pub l2_misses: u64,

    /// L2 writes
    pub l2_writes: u64,

    /// L2 sweeper evictions
    pub l2_evictions: u64,

    /// Callers served by another caller's in-flight computation
    pub stampede_waits: u64,

    /// Computations run on total miss
    pub computations: u64,

    /// Refresh-ahead replacements
    pub refreshes: u64,

    /// Refresh-ahead failures
    pub refresh_failures: u64,

    /// All hits (tiers plus stampede waits)
    pub hits: u64,

    /// Hits over all lookups
    pub hit_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert!(config.max_entries > 0);
        assert!(config.enable_l2);
        assert_eq!(config.write_mode, WriteMode::WriteBehind);
        assert_eq!(config.policy, EvictionPolicy::Lru);
    }
}
