//! # Cache Entries and Tag Index
//!
//! Entry metadata shared by both tiers, the eviction policies, and the
//! inverted tag index enabling bulk invalidation.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// Hit count at which an entry becomes hot and eviction-exempt
pub const HOT_THRESHOLD: u64 = 5;

/// Cache tier an entry lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheTier {
    /// In-memory tier
    L1,
    /// On-disk tier
    L2,
}

/// Eviction policy for a bounded tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Evict the entry with the oldest access time
    Lru,
    /// Evict the entry with the lowest hit count, ties broken by LRU
    Lfu,
    /// Evict the entry with the oldest creation time
    Fifo,
    /// Evict the entry with the earliest expiry, preferring expired
    Ttl,
}

/// One in-memory cache entry
///
/// Invariant: `expires_at`, when present, is strictly after `created_at`.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Stable key fingerprint
    pub key: String,

    /// Encoded value bytes
    pub value: Vec<u8>,

    /// Creation time
    pub created_at: Instant,

    /// Optional expiry
    pub expires_at: Option<Instant>,

    /// Last access time (reads and writes)
    pub last_accessed_at: Instant,

    /// Tags for bulk invalidation
    pub tags: HashSet<String>,

    /// Hits since creation
    pub hit_count: u64,

    /// Encoded size in bytes
    pub size_bytes: usize,

    /// Hot entries are exempt from eviction outside critical pressure
    pub hot: bool,
}

impl CacheEntry {
    /// Create an entry; `ttl = None` means no expiry
    pub fn new(key: String, value: Vec<u8>, ttl: Option<Duration>, tags: HashSet<String>) -> Self {
        let now = Instant::now();
        let size_bytes = value.len();
        Self {
            key,
            value,
            created_at: now,
            expires_at: ttl.map(|t| now + t),
            last_accessed_at: now,
            tags,
            hit_count: 0,
            size_bytes,
            hot: false,
        }
    }

    /// Whether the entry has passed its expiry
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    /// Record a hit, promoting to hot at the threshold
    pub fn touch(&mut self, now: Instant) {
        self.last_accessed_at = now;
        self.hit_count += 1;
        if self.hit_count >= HOT_THRESHOLD {
            self.hot = true;
        }
    }
}

/// Compute the stable fingerprint for a cache key
pub fn key_fingerprint(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

// ============================================================================
// Tag Index
// ============================================================================

/// Inverted index from tag to the keys carrying it
///
/// A tag's set is removed when its last referencing key is dropped.
#[derive(Debug, Default)]
pub struct TagIndex {
    index: RwLock<HashMap<String, HashSet<String>>>,
}

impl TagIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate `key` with each tag
    pub fn insert(&self, key: &str, tags: &HashSet<String>) {
        if tags.is_empty() {
            return;
        }
        let mut index = self.index.write();
        for tag in tags {
            index.entry(tag.clone()).or_default().insert(key.to_string());
        }
    }

    /// Remove `key` from each tag, dropping empty tag sets
    pub fn remove(&self, key: &str, tags: &HashSet<String>) {
        let mut index = self.index.write();
        for tag in tags {
            if let Some(keys) = index.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    index.remove(tag);
                }
            }
        }
    }

    /// Keys carrying `tag`
    pub fn keys_for(&self, tag: &str) -> Vec<String> {
        self.index
            .read()
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop a tag and its set entirely
    pub fn purge(&self, tag: &str) {
        self.index.write().remove(tag);
    }

    /// Number of indexed tags
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    /// Whether the index is empty
    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    /// Clear everything
    pub fn clear(&self) {
        self.index.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_entry_expiry() {
        let entry = CacheEntry::new(
            "k".into(),
            vec![1, 2, 3],
            Some(Duration::from_millis(10)),
            HashSet::new(),
        );
        assert!(!entry.is_expired(Instant::now()));
        assert!(entry.is_expired(Instant::now() + Duration::from_millis(20)));
        assert!(entry.expires_at.unwrap() > entry.created_at);
    }

    #[test]
    fn test_hot_promotion_at_threshold() {
        let mut entry = CacheEntry::new("k".into(), vec![], None, HashSet::new());
        let now = Instant::now();
        for _ in 0..HOT_THRESHOLD - 1 {
            entry.touch(now);
        }
        assert!(!entry.hot);
        entry.touch(now);
        assert!(entry.hot);
    }

    #[test]
    fn test_key_fingerprint_stable_and_distinct() {
        let a = key_fingerprint(&["stage1", "사과", "noun"]);
        let b = key_fingerprint(&["stage1", "사과", "noun"]);
        let c = key_fingerprint(&["stage1", "사과", "verb"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        // Part boundaries matter
        assert_ne!(key_fingerprint(&["ab", "c"]), key_fingerprint(&["a", "bc"]));
    }

    #[test]
    fn test_tag_index_round_trip() {
        let index = TagIndex::new();
        index.insert("k1", &tags(&["batch:1", "stage1"]));
        index.insert("k2", &tags(&["batch:1"]));

        let mut keys = index.keys_for("batch:1");
        keys.sort();
        assert_eq!(keys, vec!["k1", "k2"]);
        assert_eq!(index.keys_for("stage1"), vec!["k1"]);
    }

    #[test]
    fn test_tag_removed_with_last_key() {
        let index = TagIndex::new();
        index.insert("k1", &tags(&["solo"]));
        assert_eq!(index.len(), 1);

        index.remove("k1", &tags(&["solo"]));
        assert!(index.is_empty());
        assert!(index.keys_for("solo").is_empty());
    }
}
