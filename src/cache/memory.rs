//! # In-Memory Tier (L1)
//!
//! Bounded map sharded by key hash, enforcing both an entry-count and a
//! byte budget. Insertions over budget evict victims chosen by the
//! configured policy; hot entries are exempt until byte pressure is
//! critical (above 95% of the byte budget after the non-hot candidates
//! are gone).

use crate::cache::entry::{CacheEntry, EvictionPolicy};
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

/// Fraction of the byte budget at which hot entries become evictable
const CRITICAL_PRESSURE: f64 = 0.95;

/// L1 tier statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryTierStats {
    /// Current entry count
    pub entries: usize,

    /// Current byte total
    pub bytes: usize,

    /// Hits since creation
    pub hits: u64,

    /// Misses since creation
    pub misses: u64,

    /// Evictions since creation
    pub evictions: u64,

    /// Expired entries dropped on read
    pub expirations: u64,
}

/// Bounded in-memory cache tier
pub struct MemoryTier {
    /// Key-hash shards, each behind its own lock
    shards: Vec<Mutex<HashMap<String, CacheEntry>>>,

    /// Entry budget
    max_entries: usize,

    /// Byte budget
    max_bytes: usize,

    /// Eviction policy
    policy: EvictionPolicy,

    /// Current entry count
    entry_count: AtomicUsize,

    /// Current byte total
    byte_count: AtomicUsize,

    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl MemoryTier {
    /// Create a tier with 16 shards
    pub fn new(max_entries: usize, max_bytes: usize, policy: EvictionPolicy) -> Self {
        let shards = (0..16).map(|_| Mutex::new(HashMap::new())).collect();
        Self {
            shards,
            max_entries: max_entries.max(1),
            max_bytes: max_bytes.max(1),
            policy,
            entry_count: AtomicUsize::new(0),
            byte_count: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    fn shard_for(&self, key: &str) -> &Mutex<HashMap<String, CacheEntry>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % self.shards.len()]
    }

    /// Look up a key, touching it on hit; expired entries are dropped
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let now = Instant::now();
        let mut shard = self.shard_for(key).lock();

        match shard.get_mut(key) {
            Some(entry) if entry.is_expired(now) => {
                let removed = shard.remove(key).unwrap();
                self.entry_count.fetch_sub(1, Ordering::Relaxed);
                self.byte_count.fetch_sub(removed.size_bytes, Ordering::Relaxed);
                self.expirations.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Some(entry) => {
                entry.touch(now);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Whether a live (unexpired) entry exists, without touching it
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.shard_for(key)
            .lock()
            .get(key)
            .is_some_and(|e| !e.is_expired(now))
    }

    /// Insert an entry, evicting as needed
    ///
    /// Returns the evicted entries so the coordinator can demote them.
    pub fn insert(&self, entry: CacheEntry) -> Vec<CacheEntry> {
        let key = entry.key.clone();
        let size = entry.size_bytes;

        let previous = {
            let mut shard = self.shard_for(&key).lock();
            shard.insert(key, entry)
        };

        if let Some(previous) = &previous {
            self.byte_count.fetch_sub(previous.size_bytes, Ordering::Relaxed);
        } else {
            self.entry_count.fetch_add(1, Ordering::Relaxed);
        }
        self.byte_count.fetch_add(size, Ordering::Relaxed);

        self.evict_to_budget()
    }

    /// Remove a key
    pub fn remove(&self, key: &str) -> Option<CacheEntry> {
        let removed = self.shard_for(key).lock().remove(key);
        if let Some(entry) = &removed {
            self.entry_count.fetch_sub(1, Ordering::Relaxed);
            self.byte_count.fetch_sub(entry.size_bytes, Ordering::Relaxed);
        }
        removed
    }

    /// Evict victims until both budgets are met
    fn evict_to_budget(&self) -> Vec<CacheEntry> {
        let mut evicted = Vec::new();

        loop {
            let entries = self.entry_count.load(Ordering::Relaxed);
            let bytes = self.byte_count.load(Ordering::Relaxed);
            if entries <= self.max_entries && bytes <= self.max_bytes {
                break;
            }

            let critical = bytes as f64 > self.max_bytes as f64 * CRITICAL_PRESSURE;
            match self.select_victim(critical) {
                Some(key) => {
                    if let Some(entry) = self.remove(&key) {
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                        evicted.push(entry);
                    }
                }
                None => break,
            }
        }

        evicted
    }

    /// Choose the eviction victim under the configured policy
    ///
    /// Hot entries are skipped unless `include_hot`; expired entries are
    /// always preferred.
    fn select_victim(&self, include_hot: bool) -> Option<String> {
        let now = Instant::now();
        let mut best: Option<(String, VictimRank)> = None;

        for shard in &self.shards {
            let shard = shard.lock();
            for entry in shard.values() {
                if entry.hot && !include_hot && !entry.is_expired(now) {
                    continue;
                }
                let rank = VictimRank::of(entry, self.policy, now);
                match &best {
                    Some((_, current)) if rank >= *current => {}
                    _ => best = Some((entry.key.clone(), rank)),
                }
            }
        }

        match best {
            Some((key, _)) => Some(key),
            // Everything live is hot: retry including hot entries
            None if !include_hot && self.entry_count.load(Ordering::Relaxed) > 0 => {
                self.select_victim(true)
            }
            None => None,
        }
    }

    /// Snapshot all live entries (metadata and value)
    pub fn entries(&self) -> Vec<CacheEntry> {
        let now = Instant::now();
        self.shards
            .iter()
            .flat_map(|shard| {
                shard
                    .lock()
                    .values()
                    .filter(|e| !e.is_expired(now))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Entry count
    pub fn len(&self) -> usize {
        self.entry_count.load(Ordering::Relaxed)
    }

    /// Whether the tier is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Byte total
    pub fn bytes(&self) -> usize {
        self.byte_count.load(Ordering::Relaxed)
    }

    /// Tier statistics
    pub fn stats(&self) -> MemoryTierStats {
        MemoryTierStats {
            entries: self.len(),
            bytes: self.bytes(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }

    /// Drop everything
    pub fn clear(&self) {
        for shard in &self.shards {
            shard.lock().clear();
        }
        self.entry_count.store(0, Ordering::Relaxed);
        self.byte_count.store(0, Ordering::Relaxed);
    }
}

/// Ordering key for victim selection; smaller ranks evict first
#[derive(Debug, Clone, Copy, PartialEq)]
struct VictimRank {
    /// 0 when expired, 1 otherwise; expired entries always go first
    live: u8,

    /// Policy-specific primary key
    primary: f64,

    /// Tie-break on last access
    secondary: f64,
}

impl VictimRank {
    fn of(entry: &CacheEntry, policy: EvictionPolicy, now: Instant) -> Self {
        let age = |at: Instant| now.saturating_duration_since(at).as_secs_f64();
        let live = u8::from(!entry.is_expired(now));
        let secondary = -age(entry.last_accessed_at);

        let primary = match policy {
            EvictionPolicy::Lru => -age(entry.last_accessed_at),
            EvictionPolicy::Lfu => entry.hit_count as f64,
            EvictionPolicy::Fifo => -age(entry.created_at),
            EvictionPolicy::Ttl => match entry.expires_at {
                Some(at) => at.saturating_duration_since(now).as_secs_f64(),
                None => f64::MAX,
            },
        };

        Self { live, primary, secondary }
    }
}

impl PartialOrd for VictimRank {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        (self.live, self.primary, self.secondary)
            .partial_cmp(&(other.live, other.primary, other.secondary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    fn entry(key: &str, size: usize) -> CacheEntry {
        CacheEntry::new(key.to_string(), vec![0u8; size], None, HashSet::new())
    }

    #[test]
    fn test_insert_get_remove() {
        let tier = MemoryTier::new(10, 1024, EvictionPolicy::Lru);
        tier.insert(entry("a", 16));

        let got = tier.get("a").unwrap();
        assert_eq!(got.value.len(), 16);
        assert_eq!(got.hit_count, 1);

        tier.remove("a");
        assert!(tier.get("a").is_none());
        assert_eq!(tier.len(), 0);
        assert_eq!(tier.bytes(), 0);
    }

    #[test]
    fn test_entry_budget_evicts_exactly_one() {
        let tier = MemoryTier::new(3, 10_000, EvictionPolicy::Fifo);
        tier.insert(entry("a", 1));
        tier.insert(entry("b", 1));
        tier.insert(entry("c", 1));

        let evicted = tier.insert(entry("d", 1));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].key, "a");
        assert_eq!(tier.len(), 3);
    }

    #[test]
    fn test_byte_budget_enforced() {
        let tier = MemoryTier::new(100, 100, EvictionPolicy::Lru);
        tier.insert(entry("a", 60));
        tier.insert(entry("b", 60));
        assert!(tier.bytes() <= 100);
        assert_eq!(tier.len(), 1);
    }

    #[test]
    fn test_lru_evicts_least_recently_used() {
        let tier = MemoryTier::new(2, 10_000, EvictionPolicy::Lru);
        tier.insert(entry("a", 1));
        std::thread::sleep(Duration::from_millis(5));
        tier.insert(entry("b", 1));
        std::thread::sleep(Duration::from_millis(5));

        // Refresh "a" so "b" becomes the victim
        tier.get("a");
        std::thread::sleep(Duration::from_millis(5));
        let evicted = tier.insert(entry("c", 1));
        assert_eq!(evicted[0].key, "b");
        assert!(tier.contains("a"));
    }

    #[test]
    fn test_lfu_evicts_lowest_hit_count() {
        let tier = MemoryTier::new(2, 10_000, EvictionPolicy::Lfu);
        tier.insert(entry("popular", 1));
        tier.insert(entry("unpopular", 1));

        tier.get("popular");
        tier.get("popular");

        let evicted = tier.insert(entry("new", 1));
        assert_eq!(evicted[0].key, "unpopular");
    }

    #[test]
    fn test_ttl_policy_prefers_expired() {
        let tier = MemoryTier::new(2, 10_000, EvictionPolicy::Ttl);
        tier.insert(CacheEntry::new(
            "expiring".into(),
            vec![0],
            Some(Duration::from_millis(1)),
            HashSet::new(),
        ));
        tier.insert(entry("forever", 1));

        std::thread::sleep(Duration::from_millis(10));
        let evicted = tier.insert(entry("new", 1));
        assert_eq!(evicted[0].key, "expiring");
        assert!(tier.contains("forever"));
    }

    #[test]
    fn test_expired_entry_dropped_on_read() {
        let tier = MemoryTier::new(10, 1024, EvictionPolicy::Lru);
        tier.insert(CacheEntry::new(
            "short".into(),
            vec![0],
            Some(Duration::from_millis(1)),
            HashSet::new(),
        ));

        std::thread::sleep(Duration::from_millis(10));
        assert!(tier.get("short").is_none());
        assert_eq!(tier.stats().expirations, 1);
        assert_eq!(tier.len(), 0);
    }

    #[test]
    fn test_hot_entries_survive_eviction() {
        let tier = MemoryTier::new(2, 10_000, EvictionPolicy::Lru);
        tier.insert(entry("hot", 1));
        for _ in 0..5 {
            tier.get("hot");
        }
        std::thread::sleep(Duration::from_millis(5));
        tier.insert(entry("cold", 1));
        std::thread::sleep(Duration::from_millis(5));

        // "hot" is older by LRU but exempt; "cold" is the victim
        let evicted = tier.insert(entry("new", 1));
        assert_eq!(evicted[0].key, "cold");
        assert!(tier.contains("hot"));
    }

    #[test]
    fn test_replacing_key_updates_bytes() {
        let tier = MemoryTier::new(10, 1024, EvictionPolicy::Lru);
        tier.insert(entry("a", 100));
        tier.insert(entry("a", 10));
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.bytes(), 10);
    }
}
