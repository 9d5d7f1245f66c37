//! Cache tier implementations.

use crate::request::Fingerprint;
use crate::{Error, Result};
use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Which layer of the hierarchy an entry was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
    Memory,
    Disk,
}

impl std::fmt::Display for TierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TierKind::Memory => write!(f, "memory"),
            TierKind::Disk => write!(f, "disk"),
        }
    }
}

/// A cached result. Callers only ever receive clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: Value,
    pub created_at: SystemTime,
    pub expires_at: SystemTime,
    pub tier: TierKind,
    pub size_estimate: usize,
}

impl CacheEntry {
    pub fn new(value: Value, ttl: Duration) -> Self {
        let now = SystemTime::now();
        let size_estimate = estimate_size(&value);
        Self {
            value,
            created_at: now,
            expires_at: now + ttl,
            tier: TierKind::Memory,
            size_estimate,
        }
    }

    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        now > self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(SystemTime::now())
    }

    /// Time left before expiry (zero once expired).
    pub fn remaining_ttl(&self) -> Duration {
        self.expires_at
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO)
    }

    fn in_tier(mut self, tier: TierKind) -> Self {
        self.tier = tier;
        self
    }
}

/// Serialized length of a JSON value, used for byte budgets and the disk
/// write-through threshold.
pub fn estimate_size(value: &Value) -> usize {
    match value {
        Value::Null => 4,
        Value::Bool(_) => 5,
        Value::Number(n) => n.to_string().len(),
        Value::String(s) => s.len() + 2,
        Value::Array(items) => 2 + items.iter().map(|v| estimate_size(v) + 1).sum::<usize>(),
        Value::Object(map) => {
            2 + map
                .iter()
                .map(|(k, v)| k.len() + 4 + estimate_size(v))
                .sum::<usize>()
        }
    }
}

/// One layer of the cache hierarchy.
///
/// Implementations enforce their own capacity bound with strict LRU eviction
/// and report how many entries a `put` evicted.
#[async_trait]
pub trait CacheTier: Send + Sync {
    fn kind(&self) -> TierKind;
    fn name(&self) -> &'static str;
    async fn get(&self, key: &Fingerprint) -> Result<Option<CacheEntry>>;
    /// Insert or replace; returns the number of entries evicted to make room.
    async fn put(&self, key: &Fingerprint, entry: CacheEntry) -> Result<usize>;
    async fn remove(&self, key: &Fingerprint) -> Result<bool>;
    async fn keys(&self) -> Result<Vec<Fingerprint>>;
    /// Drop every entry expired at `now`; returns how many were removed.
    async fn sweep_expired(&self, now: SystemTime) -> Result<usize>;
    async fn len(&self) -> Result<usize>;
    async fn clear(&self) -> Result<()>;
}

struct MemoryState {
    entries: LruCache<Fingerprint, CacheEntry>,
    bytes: usize,
}

/// In-memory LRU tier bounded by entry count and, optionally, bytes.
pub struct MemoryTier {
    state: Mutex<MemoryState>,
    max_bytes: Option<usize>,
}

impl MemoryTier {
    pub fn new(max_entries: usize) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Mutex::new(MemoryState {
                entries: LruCache::new(cap),
                bytes: 0,
            }),
            max_bytes: None,
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| Error::cache_io("memory", "memory tier lock poisoned"))
    }
}

#[async_trait]
impl CacheTier for MemoryTier {
    fn kind(&self) -> TierKind {
        TierKind::Memory
    }

    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &Fingerprint) -> Result<Option<CacheEntry>> {
        let mut st = self.lock()?;
        let expired = match st.entries.peek(key) {
            None => return Ok(None),
            Some(e) => e.is_expired(),
        };
        if expired {
            if let Some(e) = st.entries.pop(key) {
                st.bytes = st.bytes.saturating_sub(e.size_estimate);
            }
            return Ok(None);
        }
        // `get` marks the entry most recently used.
        Ok(st.entries.get(key).cloned())
    }

    async fn put(&self, key: &Fingerprint, entry: CacheEntry) -> Result<usize> {
        let mut st = self.lock()?;
        let entry = entry.in_tier(TierKind::Memory);
        let size = entry.size_estimate;
        let mut evicted = 0;
        if let Some((old_key, old)) = st.entries.push(key.clone(), entry) {
            st.bytes = st.bytes.saturating_sub(old.size_estimate);
            if &old_key != key {
                evicted += 1;
            }
        }
        st.bytes += size;
        if let Some(max) = self.max_bytes {
            // Never evict the entry just written.
            while st.bytes > max && st.entries.len() > 1 {
                match st.entries.pop_lru() {
                    Some((_, e)) => {
                        st.bytes = st.bytes.saturating_sub(e.size_estimate);
                        evicted += 1;
                    }
                    None => break,
                }
            }
        }
        Ok(evicted)
    }

    async fn remove(&self, key: &Fingerprint) -> Result<bool> {
        let mut st = self.lock()?;
        match st.entries.pop(key) {
            Some(e) => {
                st.bytes = st.bytes.saturating_sub(e.size_estimate);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn keys(&self) -> Result<Vec<Fingerprint>> {
        Ok(self.lock()?.entries.iter().map(|(k, _)| k.clone()).collect())
    }

    async fn sweep_expired(&self, now: SystemTime) -> Result<usize> {
        let mut st = self.lock()?;
        let expired: Vec<Fingerprint> = st
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired_at(now))
            .map(|(k, _)| k.clone())
            .collect();
        for k in &expired {
            if let Some(e) = st.entries.pop(k) {
                st.bytes = st.bytes.saturating_sub(e.size_estimate);
            }
        }
        Ok(expired.len())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.lock()?.entries.len())
    }

    async fn clear(&self) -> Result<()> {
        let mut st = self.lock()?;
        st.entries.clear();
        st.bytes = 0;
        Ok(())
    }
}

/// On-disk record: the key travels with the entry so the index can be rebuilt.
#[derive(Serialize, Deserialize)]
struct DiskRecord {
    key: Fingerprint,
    entry: CacheEntry,
}

/// Directory-backed tier: one JSON file per entry, LRU index in memory.
///
/// The index is rebuilt from the directory on [`DiskTier::open`], oldest
/// `created_at` first. Unreadable files are skipped and deleted.
pub struct DiskTier {
    dir: PathBuf,
    index: Mutex<LruCache<Fingerprint, SystemTime>>,
}

impl DiskTier {
    pub async fn open(dir: impl AsRef<Path>, max_entries: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::cache_io("disk", format!("create {}: {}", dir.display(), e)))?;

        let cap = NonZeroUsize::new(max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        let mut found: Vec<(Fingerprint, SystemTime)> = Vec::new();
        let mut rd = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| Error::cache_io("disk", e.to_string()))?;
        while let Some(item) = rd
            .next_entry()
            .await
            .map_err(|e| Error::cache_io("disk", e.to_string()))?
        {
            let path = item.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            match read_record(&path).await {
                Ok(rec) => found.push((rec.key, rec.entry.created_at)),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "dropping unreadable disk cache file");
                    let _ = tokio::fs::remove_file(&path).await;
                }
            }
        }
        found.sort_by_key(|(_, created)| *created);

        let mut index = LruCache::new(cap);
        let mut overflow = Vec::new();
        for (key, created) in found {
            if let Some((old, _)) = index.push(key, created) {
                overflow.push(old);
            }
        }
        let tier = Self {
            dir,
            index: Mutex::new(index),
        };
        for key in overflow {
            let _ = tokio::fs::remove_file(tier.path_for(&key)).await;
        }
        debug!(dir = %tier.dir.display(), "disk cache tier opened");
        Ok(tier)
    }

    fn path_for(&self, key: &Fingerprint) -> PathBuf {
        self.dir.join(format!("{}.json", key.digest()))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LruCache<Fingerprint, SystemTime>>> {
        self.index
            .lock()
            .map_err(|_| Error::cache_io("disk", "disk index lock poisoned"))
    }

    async fn delete_file(&self, key: &Fingerprint) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::cache_io("disk", e.to_string())),
        }
    }
}

async fn read_record(path: &Path) -> Result<DiskRecord> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| Error::cache_io("disk", format!("read {}: {}", path.display(), e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::cache_io("disk", format!("decode {}: {}", path.display(), e)))
}

#[async_trait]
impl CacheTier for DiskTier {
    fn kind(&self) -> TierKind {
        TierKind::Disk
    }

    fn name(&self) -> &'static str {
        "disk"
    }

    async fn get(&self, key: &Fingerprint) -> Result<Option<CacheEntry>> {
        if !self.lock()?.contains(key) {
            return Ok(None);
        }
        let rec = match read_record(&self.path_for(key)).await {
            Ok(rec) => rec,
            Err(e) => {
                self.lock()?.pop(key);
                let _ = self.delete_file(key).await;
                return Err(e);
            }
        };
        if &rec.key != key {
            // Digest collision across targets; treat as a miss.
            return Ok(None);
        }
        if rec.entry.is_expired() {
            self.lock()?.pop(key);
            self.delete_file(key).await?;
            return Ok(None);
        }
        self.lock()?.get(key);
        Ok(Some(rec.entry.in_tier(TierKind::Disk)))
    }

    async fn put(&self, key: &Fingerprint, entry: CacheEntry) -> Result<usize> {
        let entry = entry.in_tier(TierKind::Disk);
        let created = entry.created_at;
        let bytes = serde_json::to_vec(&DiskRecord {
            key: key.clone(),
            entry,
        })
        .map_err(|e| Error::cache_io("disk", format!("encode: {}", e)))?;

        // Write to a temp file then rename so readers never see a torn record.
        let path = self.path_for(key);
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| Error::cache_io("disk", format!("write {}: {}", tmp.display(), e)))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Error::cache_io("disk", format!("rename {}: {}", path.display(), e)));
        }

        let evicted = {
            let mut index = self.lock()?;
            match index.push(key.clone(), created) {
                Some((old, _)) if &old != key => Some(old),
                _ => None,
            }
        };
        match evicted {
            Some(old) => {
                self.delete_file(&old).await?;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn remove(&self, key: &Fingerprint) -> Result<bool> {
        let existed = self.lock()?.pop(key).is_some();
        if existed {
            self.delete_file(key).await?;
        }
        Ok(existed)
    }

    async fn keys(&self) -> Result<Vec<Fingerprint>> {
        Ok(self.lock()?.iter().map(|(k, _)| k.clone()).collect())
    }

    async fn sweep_expired(&self, now: SystemTime) -> Result<usize> {
        let mut removed = 0;
        for key in self.keys().await? {
            match read_record(&self.path_for(&key)).await {
                Ok(rec) if !rec.entry.is_expired_at(now) => continue,
                Ok(_) => {}
                Err(e) => warn!(key = %key, error = %e, "removing unreadable disk cache entry"),
            }
            self.lock()?.pop(&key);
            self.delete_file(&key).await?;
            removed += 1;
        }
        Ok(removed)
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    async fn clear(&self) -> Result<()> {
        for key in self.keys().await? {
            self.lock()?.pop(&key);
            self.delete_file(&key).await?;
        }
        Ok(())
    }
}
