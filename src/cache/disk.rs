//! # On-Disk Tier (L2)
//!
//! Persistent cache tier with fan-out directories, optional gzip
//! compression above a size threshold, and atomic writes (temp file,
//! fsync, rename). A size-capped sweeper evicts oldest-first in batches
//! so partial writes are never torn.

use crate::cache::entry::EvictionPolicy;
use crate::cache::{CacheError, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Stored representation of one L2 entry
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    /// Creation time, unix seconds
    created_at: u64,

    /// Expiry, unix seconds
    expires_at: Option<u64>,

    /// Tags for bulk invalidation
    tags: HashSet<String>,

    /// Whether `value` is gzip-compressed
    compressed: bool,

    /// Encoded (possibly compressed) value bytes
    value: Vec<u8>,
}

/// L2 tier statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskTierStats {
    /// Read hits
    pub hits: u64,

    /// Read misses
    pub misses: u64,

    /// Writes completed
    pub writes: u64,

    /// Files removed by the sweeper
    pub evictions: u64,

    /// Expired entries dropped on read
    pub expirations: u64,
}

/// On-disk cache tier
pub struct DiskTier {
    /// Root directory
    root: PathBuf,

    /// Size budget enforced by the sweeper
    max_bytes: u64,

    /// Values at or above this size are compressed
    compression_threshold: usize,

    /// Eviction policy; ordering falls back to file age where the
    /// policy's signal is not persisted
    policy: EvictionPolicy,

    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl DiskTier {
    /// Open (creating if needed) a disk tier rooted at `root`
    pub async fn open(
        root: impl Into<PathBuf>,
        max_bytes: u64,
        compression_threshold: usize,
        policy: EvictionPolicy,
    ) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| CacheError::Io(format!("create cache dir {:?}: {}", root, e)))?;
        Ok(Self {
            root,
            max_bytes,
            compression_threshold,
            policy,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        })
    }

    /// Fan-out path for a key: `root/H(key)[0..2]/H(key)`
    fn path_for(&self, key: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        self.root.join(&digest[..2]).join(&digest)
    }

    fn now_secs() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    /// Write an entry atomically
    pub async fn put(
        &self,
        key: &str,
        value: &[u8],
        ttl_secs: Option<u64>,
        tags: &HashSet<String>,
    ) -> Result<()> {
        let compressed = value.len() >= self.compression_threshold;
        let stored_value = if compressed {
            compress(value)?
        } else {
            value.to_vec()
        };

        let now = Self::now_secs();
        let stored = StoredEntry {
            created_at: now,
            expires_at: ttl_secs.map(|t| now + t),
            tags: tags.clone(),
            compressed,
            value: stored_value,
        };
        let encoded = bincode::serialize(&stored)
            .map_err(|e| CacheError::Serialization(e.to_string()))?;

        let path = self.path_for(key);
        let dir = path.parent().expect("fan-out path has a parent");
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| CacheError::Io(format!("create dir {:?}: {}", dir, e)))?;

        // Atomic write: temp file, fsync, rename
        let temp = dir.join(format!(".tmp-{}", Uuid::new_v4()));
        {
            let mut file = tokio::fs::File::create(&temp)
                .await
                .map_err(|e| CacheError::Io(format!("create {:?}: {}", temp, e)))?;
            tokio::io::AsyncWriteExt::write_all(&mut file, &encoded)
                .await
                .map_err(|e| CacheError::Io(format!("write {:?}: {}", temp, e)))?;
            file.sync_all()
                .await
                .map_err(|e| CacheError::Io(format!("fsync {:?}: {}", temp, e)))?;
        }
        tokio::fs::rename(&temp, &path)
            .await
            .map_err(|e| CacheError::Io(format!("rename into {:?}: {}", path, e)))?;

        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Read an entry; expired entries are removed and miss
    pub async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, HashSet<String>)>> {
        let path = self.path_for(key);
        let encoded = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
            Err(e) => return Err(CacheError::Io(format!("read {:?}: {}", path, e))),
        };

        let stored: StoredEntry = match bincode::deserialize(&encoded) {
            Ok(stored) => stored,
            Err(_) => {
                // Unreadable entries are dropped, not surfaced
                let _ = tokio::fs::remove_file(&path).await;
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
        };

        if stored.expires_at.is_some_and(|at| Self::now_secs() >= at) {
            let _ = tokio::fs::remove_file(&path).await;
            self.expirations.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        let value = if stored.compressed {
            decompress(&stored.value)?
        } else {
            stored.value
        };

        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some((value, stored.tags)))
    }

    /// Remove an entry; returns whether it existed
    pub async fn remove(&self, key: &str) -> bool {
        tokio::fs::remove_file(self.path_for(key)).await.is_ok()
    }

    /// Total bytes on disk
    pub async fn size_on_disk(&self) -> u64 {
        self.walk_files().await.iter().map(|(_, size, _)| size).sum()
    }

    /// Enforce the size budget, deleting expired entries first and then
    /// the policy's victims
    ///
    /// Removals are collected first and deleted in one batch, so a sweep
    /// never interleaves with a half-observed write.
    pub async fn sweep(&self) -> u64 {
        let files = self.walk_files().await;
        let total: u64 = files.iter().map(|(_, size, _)| size).sum();
        if total <= self.max_bytes {
            return 0;
        }

        // Rank candidates from the stored headers: expired entries sort
        // first, then the policy's ordering. The access-recency signal is
        // not persisted, so LRU and LFU fall back to creation age.
        let now = Self::now_secs();
        let mut ranked: Vec<(PathBuf, u64, u64, SystemTime)> = Vec::with_capacity(files.len());
        for (path, size, modified) in files {
            let rank = match tokio::fs::read(&path).await {
                Ok(bytes) => match bincode::deserialize::<StoredEntry>(&bytes) {
                    Ok(stored) if stored.expires_at.is_some_and(|at| now >= at) => 0,
                    Ok(stored) => match self.policy {
                        EvictionPolicy::Ttl => stored.expires_at.unwrap_or(u64::MAX),
                        _ => stored.created_at.max(1),
                    },
                    // Unreadable entries evict first
                    Err(_) => 0,
                },
                Err(_) => continue,
            };
            ranked.push((path, size, rank, modified));
        }
        // File mtime breaks ties within the same second
        ranked.sort_by_key(|(_, _, rank, modified)| (*rank, *modified));

        let mut to_remove = Vec::new();
        let mut excess = total.saturating_sub(self.max_bytes);
        for (path, size, _, _) in ranked {
            if excess == 0 {
                break;
            }
            excess = excess.saturating_sub(size);
            to_remove.push(path);
        }

        let mut removed = 0;
        for path in to_remove {
            if tokio::fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }
        self.evictions.fetch_add(removed, Ordering::Relaxed);
        if removed > 0 {
            log::debug!("disk cache sweep removed {} entries", removed);
        }
        removed
    }

    /// Remove every entry
    pub async fn clear(&self) -> Result<()> {
        let files = self.walk_files().await;
        for (path, _, _) in files {
            let _ = tokio::fs::remove_file(path).await;
        }
        Ok(())
    }

    /// Tier statistics
    pub fn stats(&self) -> DiskTierStats {
        DiskTierStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }

    /// All entry files: (path, size, modified time)
    async fn walk_files(&self) -> Vec<(PathBuf, u64, SystemTime)> {
        let mut files = Vec::new();
        let mut dirs = match tokio::fs::read_dir(&self.root).await {
            Ok(dirs) => dirs,
            Err(_) => return files,
        };

        while let Ok(Some(dir)) = dirs.next_entry().await {
            if !dir.path().is_dir() {
                continue;
            }
            let mut entries = match tokio::fs::read_dir(dir.path()).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if is_temp_file(&path) {
                    continue;
                }
                if let Ok(meta) = entry.metadata().await {
                    if meta.is_file() {
                        let modified = meta.modified().unwrap_or(UNIX_EPOCH);
                        files.push((path, meta.len(), modified));
                    }
                }
            }
        }
        files
    }
}

fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(".tmp-"))
}

fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|e| CacheError::Compression(e.to_string()))
}

fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| CacheError::Compression(e.to_string()))?;
    Ok(out)
}
