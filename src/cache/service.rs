//! # Cache Coordinator
//!
//! Orchestrates the two tiers: lookups go L1 then L2 (promoting hits),
//! total misses run the caller's computation under stampede suppression,
//! and writes land in L1 with a write-behind (or write-through) copy to
//! L2. Entries evicted from L1 demote to L2 so the disk tier keeps the
//! overflow.
//!
//! Also provides tag invalidation across both tiers, refresh-ahead
//! registration, batch warming, and a periodic L2 sweeper.

use crate::cache::disk::DiskTier;
use crate::cache::entry::{key_fingerprint, CacheEntry, TagIndex};
use crate::cache::memory::MemoryTier;
use crate::cache::{CacheConfig, CacheError, CacheServiceStats, WriteMode};
use crate::error::{ErrorKind, PipelineError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Result of a typed lookup
#[derive(Debug, Clone)]
pub struct CacheLookup<T> {
    /// The value
    pub value: T,

    /// Whether it came from a tier or a stampede wait rather than a
    /// fresh computation
    pub from_cache: bool,
}

/// One in-flight computation shared by all waiters for a key
type SharedComputation =
    Shared<BoxFuture<'static, std::result::Result<Vec<u8>, PipelineError>>>;

/// Snapshot of one entry for the analytics mirror
#[derive(Debug, Clone)]
pub struct CacheMetadataRow {
    /// Key fingerprint
    pub key: String,

    /// Tier label
    pub tier: &'static str,

    /// Tags, comma-joined for persistence
    pub tags: Vec<String>,

    /// Creation time (wall clock)
    pub created_at: chrono::DateTime<chrono::Utc>,

    /// Expiry (wall clock)
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,

    /// Hits since creation
    pub hit_count: u64,

    /// Encoded size
    pub size_bytes: usize,

    /// Hot flag
    pub hot: bool,
}

/// Two-tier cache service
pub struct CacheService {
    /// In-memory tier
    l1: MemoryTier,

    /// Optional disk tier
    l2: Option<Arc<DiskTier>>,

    /// Cross-tier tag index
    tags: TagIndex,

    /// In-flight computations for stampede suppression
    inflight: DashMap<String, SharedComputation>,

    /// Refresh-ahead tasks by key
    refresh_tasks: Mutex<HashMap<String, JoinHandle<()>>>,

    /// Configuration
    config: CacheConfig,

    /// Followers served by another caller's computation
    stampede_waits: AtomicU64,

    /// Computations run
    computations: AtomicU64,

    /// Refresh-ahead replacements
    refreshes: AtomicU64,

    /// Refresh-ahead failures (stale value kept)
    refresh_failures: AtomicU64,
}

impl CacheService {
    /// Create the service, opening the disk tier when enabled
    pub async fn new(config: CacheConfig) -> Result<Arc<Self>, CacheError> {
        let l2 = if config.enable_l2 {
            Some(Arc::new(
                DiskTier::open(
                    &config.l2_directory,
                    config.l2_max_bytes,
                    config.compression_threshold,
                    config.policy,
                )
                .await?,
            ))
        } else {
            None
        };

        Ok(Arc::new(Self {
            l1: MemoryTier::new(config.max_entries, config.max_bytes, config.policy),
            l2,
            tags: TagIndex::new(),
            inflight: DashMap::new(),
            refresh_tasks: Mutex::new(HashMap::new()),
            config,
            stampede_waits: AtomicU64::new(0),
            computations: AtomicU64::new(0),
            refreshes: AtomicU64::new(0),
            refresh_failures: AtomicU64::new(0),
        }))
    }

    /// Build a cache key fingerprint from parts
    pub fn fingerprint(parts: &[&str]) -> String {
        key_fingerprint(parts)
    }

    // ========================================================================
    // Raw byte paths
    // ========================================================================

    /// Tiered lookup: L1, then L2 with promotion
    pub async fn get_bytes(&self, key: &str) -> Option<Vec<u8>> {
        if let Some(entry) = self.l1.get(key) {
            return Some(entry.value);
        }

        let l2 = self.l2.as_ref()?;
        match l2.get(key).await {
            Ok(Some((value, tags))) => {
                // Promote to L1 and drop the disk copy; an entry lives in
                // one tier at a time once promotion has applied
                let evicted =
                    self.insert_l1(key, value.clone(), self.remaining_ttl_default(), tags);
                self.demote(evicted);
                l2.remove(key).await;
                Some(value)
            }
            Ok(None) => None,
            Err(e) => {
                log::warn!("disk cache read failed for {}: {}", key, e);
                None
            }
        }
    }

    /// Write to L1 and copy to L2 per the configured write mode
    pub async fn set_bytes(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
        tags: HashSet<String>,
    ) {
        let evicted = self.insert_l1(key, value.clone(), ttl, tags.clone());
        self.demote(evicted);

        if let Some(l2) = &self.l2 {
            let ttl_secs = ttl.map(|t| t.as_secs());
            match self.config.write_mode {
                WriteMode::WriteThrough => {
                    if let Err(e) = l2.put(key, &value, ttl_secs, &tags).await {
                        log::warn!("disk cache write failed for {}: {}", key, e);
                    }
                }
                WriteMode::WriteBehind => {
                    let l2 = l2.clone();
                    let key = key.to_string();
                    tokio::spawn(async move {
                        if let Err(e) = l2.put(&key, &value, ttl_secs, &tags).await {
                            log::warn!("disk cache write failed for {}: {}", key, e);
                        }
                    });
                }
            }
        }
    }

    fn insert_l1(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
        tags: HashSet<String>,
    ) -> Vec<CacheEntry> {
        self.tags.insert(key, &tags);
        let entry = CacheEntry::new(key.to_string(), value, ttl, tags);
        self.l1.insert(entry)
    }

    /// Write entries evicted from L1 down to L2
    fn demote(&self, evicted: Vec<CacheEntry>) {
        let Some(l2) = &self.l2 else { return };
        let now = Instant::now();

        for entry in evicted {
            if entry.is_expired(now) {
                self.tags.remove(&entry.key, &entry.tags);
                continue;
            }
            let ttl_secs = entry
                .expires_at
                .map(|at| at.saturating_duration_since(now).as_secs());
            let l2 = l2.clone();
            tokio::spawn(async move {
                if let Err(e) = l2.put(&entry.key, &entry.value, ttl_secs, &entry.tags).await {
                    log::warn!("demotion to disk failed for {}: {}", entry.key, e);
                }
            });
        }
    }

    fn remaining_ttl_default(&self) -> Option<Duration> {
        self.config.default_ttl
    }

    // ========================================================================
    // Typed paths
    // ========================================================================

    /// Typed lookup
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.get_bytes(key).await?;
        match bincode::deserialize(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!("cache entry for {} undecodable: {}", key, e);
                self.l1.remove(key);
                None
            }
        }
    }

    /// Typed write
    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        tags: HashSet<String>,
    ) -> Result<(), CacheError> {
        let bytes =
            bincode::serialize(value).map_err(|e| CacheError::Serialization(e.to_string()))?;
        self.set_bytes(key, bytes, ttl, tags).await;
        Ok(())
    }

    /// Lookup with stampede-suppressed computation on total miss
    ///
    /// Exactly one concurrent caller per key runs `compute`; the rest
    /// wait on its shared result and report `from_cache = true`.
    /// Computation failures propagate to every waiter and cache nothing.
    pub async fn get_or_compute<T, F, Fut>(
        self: &Arc<Self>,
        key: &str,
        ttl: Option<Duration>,
        tags: HashSet<String>,
        compute: F,
    ) -> crate::error::Result<CacheLookup<T>>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut,
        Fut: Future<Output = crate::error::Result<T>> + Send + 'static,
    {
        if let Some(value) = self.get::<T>(key).await {
            return Ok(CacheLookup { value, from_cache: true });
        }

        let (computation, leader) = match self.inflight.entry(key.to_string()) {
            Entry::Occupied(occupied) => {
                self.stampede_waits.fetch_add(1, Ordering::Relaxed);
                (occupied.get().clone(), false)
            }
            Entry::Vacant(vacant) => {
                let future = compute();
                let service = self.clone();
                let owned_key = key.to_string();
                let owned_tags = tags.clone();
                let shared: SharedComputation = async move {
                    let value = future.await?;
                    let bytes = bincode::serialize(&value).map_err(|e| {
                        PipelineError::new(
                            ErrorKind::Cache,
                            crate::error::ErrorCategory::System,
                            format!("cache encoding failed: {}", e),
                            "cache",
                        )
                    })?;
                    service.set_bytes(&owned_key, bytes.clone(), ttl, owned_tags).await;
                    Ok(bytes)
                }
                .boxed()
                .shared();
                vacant.insert(shared.clone());
                self.computations.fetch_add(1, Ordering::Relaxed);
                (shared, true)
            }
        };

        let result = computation.await;
        if leader {
            self.inflight.remove(key);
        }

        let bytes = result?;
        let value = bincode::deserialize(&bytes).map_err(|e| {
            PipelineError::new(
                ErrorKind::Cache,
                crate::error::ErrorCategory::System,
                format!("cache decoding failed: {}", e),
                "cache",
            )
        })?;

        Ok(CacheLookup { value, from_cache: !leader })
    }

    // ========================================================================
    // Invalidation
    // ========================================================================

    /// Remove one key from both tiers
    pub async fn delete(&self, key: &str) {
        if let Some(entry) = self.l1.remove(key) {
            self.tags.remove(key, &entry.tags);
        }
        if let Some(l2) = &self.l2 {
            l2.remove(key).await;
        }
    }

    /// Remove every key carrying `tag` from both tiers
    ///
    /// Returns the number of keys invalidated.
    pub async fn delete_by_tag(&self, tag: &str) -> usize {
        let keys = self.tags.keys_for(tag);
        for key in &keys {
            if let Some(entry) = self.l1.remove(key) {
                self.tags.remove(key, &entry.tags);
            }
            if let Some(l2) = &self.l2 {
                l2.remove(key).await;
            }
        }
        self.tags.purge(tag);
        keys.len()
    }

    /// Drop everything from both tiers
    pub async fn clear(&self) {
        self.l1.clear();
        self.tags.clear();
        if let Some(l2) = &self.l2 {
            let _ = l2.clear().await;
        }
    }

    // ========================================================================
    // Refresh-ahead and warming
    // ========================================================================

    /// Register a key for refresh-ahead
    ///
    /// A background task recomputes the value `refresh_before` ahead of
    /// each expiry and atomically replaces the entry. A failed refresh
    /// keeps the stale value and logs a degraded-mode event.
    pub fn start_refresh_ahead<T, F>(
        self: &Arc<Self>,
        key: &str,
        ttl: Duration,
        refresh_before: Duration,
        compute: F,
    ) where
        T: Serialize + Send + 'static,
        F: Fn() -> BoxFuture<'static, crate::error::Result<T>> + Send + Sync + 'static,
    {
        let service = self.clone();
        let owned_key = key.to_string();
        let interval = ttl.saturating_sub(refresh_before).max(Duration::from_millis(10));

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;

                match compute().await {
                    Ok(value) => match bincode::serialize(&value) {
                        Ok(bytes) => {
                            service
                                .set_bytes(&owned_key, bytes, Some(ttl), HashSet::new())
                                .await;
                            service.refreshes.fetch_add(1, Ordering::Relaxed);
                            log::debug!("refreshed cache entry {}", owned_key);
                        }
                        Err(e) => {
                            service.refresh_failures.fetch_add(1, Ordering::Relaxed);
                            log::warn!("refresh encoding failed for {}: {}", owned_key, e);
                        }
                    },
                    Err(e) => {
                        // Stale value stays in place
                        service.refresh_failures.fetch_add(1, Ordering::Relaxed);
                        log::warn!(
                            "refresh-ahead failed for {}, serving stale value: {}",
                            owned_key,
                            e
                        );
                    }
                }
            }
        });

        if let Some(previous) = self.refresh_tasks.lock().insert(key.to_string(), handle) {
            previous.abort();
        }
    }

    /// Stop refresh-ahead for one key
    pub fn stop_refresh_ahead(&self, key: &str) -> bool {
        match self.refresh_tasks.lock().remove(key) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Stop every refresh-ahead task
    pub fn stop_all_refresh(&self) {
        let mut tasks = self.refresh_tasks.lock();
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
    }

    /// Populate the cache for `keys` in bounded-concurrency batches
    ///
    /// Keys already present are skipped. Returns the number of keys
    /// actually computed.
    pub async fn warm<T, F, Fut>(
        self: &Arc<Self>,
        keys: Vec<String>,
        ttl: Option<Duration>,
        batch_size: usize,
        compute: F,
    ) -> usize
    where
        T: Serialize + DeserializeOwned + Send,
        F: Fn(String) -> Fut,
        Fut: Future<Output = crate::error::Result<T>> + Send + 'static,
    {
        let mut computed = 0;
        for chunk in keys.chunks(batch_size.max(1)) {
            let lookups = chunk.iter().filter(|key| !self.l1.contains(key.as_str()));
            let futures: Vec<_> = lookups
                .map(|key| {
                    let fut = compute(key.clone());
                    self.get_or_compute::<T, _, _>(key, ttl, HashSet::new(), move || fut)
                })
                .collect();

            for result in futures::future::join_all(futures).await {
                match result {
                    Ok(lookup) if !lookup.from_cache => computed += 1,
                    Ok(_) => {}
                    Err(e) => log::warn!("cache warming failed: {}", e),
                }
            }
        }
        computed
    }

    // ========================================================================
    // Maintenance and observability
    // ========================================================================

    /// Spawn the periodic L2 sweeper; no-op without a disk tier
    pub fn spawn_sweeper(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let l2 = self.l2.clone()?;
        let interval = self.config.sweep_interval;
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                l2.sweep().await;
            }
        }))
    }

    /// Combined service statistics
    pub fn stats(&self) -> CacheServiceStats {
        let l1 = self.l1.stats();
        let l2 = self.l2.as_ref().map(|tier| tier.stats()).unwrap_or_default();
        let stampede_waits = self.stampede_waits.load(Ordering::Relaxed);

        let hits = l1.hits + l2.hits + stampede_waits;
        let misses = self.computations.load(Ordering::Relaxed);
        let lookups = hits + misses;

        CacheServiceStats {
            l1_entries: l1.entries,
            l1_bytes: l1.bytes,
            l1_hits: l1.hits,
            l1_misses: l1.misses,
            l1_evictions: l1.evictions,
            l2_hits: l2.hits,
            l2_misses: l2.misses,
            l2_writes: l2.writes,
            l2_evictions: l2.evictions,
            stampede_waits,
            computations: misses,
            refreshes: self.refreshes.load(Ordering::Relaxed),
            refresh_failures: self.refresh_failures.load(Ordering::Relaxed),
            hits,
            hit_rate: if lookups > 0 {
                hits as f64 / lookups as f64
            } else {
                0.0
            },
        }
    }

    /// Metadata snapshot of the in-memory tier for the analytics mirror
    pub fn metadata(&self) -> Vec<CacheMetadataRow> {
        let now = Instant::now();
        let wall_now = chrono::Utc::now();

        self.l1
            .entries()
            .into_iter()
            .map(|entry| {
                let age = now.saturating_duration_since(entry.created_at);
                let expires_at = entry.expires_at.map(|at| {
                    wall_now
                        + chrono::Duration::from_std(at.saturating_duration_since(now))
                            .unwrap_or_else(|_| chrono::Duration::zero())
                });
                CacheMetadataRow {
                    key: entry.key,
                    tier: "L1",
                    tags: entry.tags.into_iter().collect(),
                    created_at: wall_now
                        - chrono::Duration::from_std(age)
                            .unwrap_or_else(|_| chrono::Duration::zero()),
                    expires_at,
                    hit_count: entry.hit_count,
                    size_bytes: entry.size_bytes,
                    hot: entry.hot,
                }
            })
            .collect()
    }
}
