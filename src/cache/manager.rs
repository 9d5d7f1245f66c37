//! Tiered cache store.

use super::backend::{CacheEntry, CacheTier, MemoryTier, TierKind};
use super::pattern::KeyPattern;
use crate::request::Fingerprint;
use crate::Result;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Which tiers a `put` writes to.
#[derive(Debug, Clone)]
pub struct CacheStoreConfig {
    /// Number of tiers (fastest first) a put may write through to.
    pub write_through_depth: usize,
    /// Entries smaller than this stay out of tiers below the first one.
    pub min_size_for_lower_tiers: usize,
    pub enabled: bool,
}

impl Default for CacheStoreConfig {
    fn default() -> Self {
        Self {
            write_through_depth: usize::MAX,
            min_size_for_lower_tiers: 0,
            enabled: true,
        }
    }
}

impl CacheStoreConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_write_through_depth(mut self, depth: usize) -> Self {
        self.write_through_depth = depth.max(1);
        self
    }
    pub fn with_min_size_for_lower_tiers(mut self, bytes: usize) -> Self {
        self.min_size_for_lower_tiers = bytes;
        self
    }
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TierStats {
    pub kind: Option<TierKind>,
    pub size: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub promotions: u64,
    pub invalidations: u64,
    /// Tier failures that were swallowed.
    pub io_errors: u64,
    /// Entries in the fastest tier.
    pub size: usize,
    pub tiers: Vec<TierStats>,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct AtomicStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    promotions: AtomicU64,
    invalidations: AtomicU64,
    io_errors: AtomicU64,
}

/// Ordered list of tiers (fastest first) behind one get/put/invalidate API.
///
/// A hit in a slower tier is promoted into every faster tier with the same
/// expiry, so faster tiers never hold data newer than slower ones. Tier
/// failures are logged and skipped; they never fail a lookup or a write.
pub struct CacheStore {
    tiers: Vec<Arc<dyn CacheTier>>,
    config: CacheStoreConfig,
    stats: AtomicStats,
}

impl CacheStore {
    pub fn new(tiers: Vec<Arc<dyn CacheTier>>, config: CacheStoreConfig) -> Self {
        Self {
            tiers,
            config,
            stats: AtomicStats::default(),
        }
    }

    /// Single in-memory tier, handy for tests and small tools.
    pub fn memory(capacity: usize) -> Self {
        Self::new(
            vec![Arc::new(MemoryTier::new(capacity))],
            CacheStoreConfig::default(),
        )
    }

    pub fn tier_count(&self) -> usize {
        self.tiers.len()
    }

    pub async fn get(&self, key: &Fingerprint) -> Option<CacheEntry> {
        if !self.config.enabled {
            return None;
        }
        for (depth, tier) in self.tiers.iter().enumerate() {
            match tier.get(key).await {
                Ok(Some(entry)) => {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    if depth > 0 {
                        self.promote(key, &entry, depth).await;
                    }
                    debug!(fingerprint = %key, tier = tier.name(), "cache hit");
                    return Some(entry);
                }
                Ok(None) => {}
                Err(e) => {
                    self.stats.io_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(fingerprint = %key, tier = tier.name(), error = %e, "cache tier read failed; treating as miss");
                }
            }
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        debug!(fingerprint = %key, "cache miss");
        None
    }

    async fn promote(&self, key: &Fingerprint, entry: &CacheEntry, found_at: usize) {
        for tier in &self.tiers[..found_at] {
            match tier.put(key, entry.clone()).await {
                Ok(evicted) => {
                    self.stats
                        .evictions
                        .fetch_add(evicted as u64, Ordering::Relaxed);
                    self.stats.promotions.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.stats.io_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(fingerprint = %key, tier = tier.name(), error = %e, "cache promotion failed");
                }
            }
        }
    }

    /// Store `value` for `ttl`. A zero TTL is a no-op.
    pub async fn put(&self, key: &Fingerprint, value: Value, ttl: Duration) {
        if !self.config.enabled || ttl.is_zero() {
            return;
        }
        let entry = CacheEntry::new(value, ttl);
        for (depth, tier) in self.tiers.iter().enumerate() {
            if depth >= self.config.write_through_depth {
                break;
            }
            if depth > 0 && entry.size_estimate < self.config.min_size_for_lower_tiers {
                break;
            }
            match tier.put(key, entry.clone()).await {
                Ok(evicted) => {
                    if evicted > 0 {
                        debug!(tier = tier.name(), evicted, "cache tier evicted entries");
                    }
                    self.stats
                        .evictions
                        .fetch_add(evicted as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    self.stats.io_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(fingerprint = %key, tier = tier.name(), error = %e, "cache tier write skipped");
                }
            }
        }
    }

    /// Remove one key from every tier.
    pub async fn remove(&self, key: &Fingerprint) -> bool {
        let mut removed = false;
        for tier in &self.tiers {
            match tier.remove(key).await {
                Ok(r) => removed |= r,
                Err(e) => {
                    self.stats.io_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(fingerprint = %key, tier = tier.name(), error = %e, "cache remove failed");
                }
            }
        }
        removed
    }

    /// Remove every entry whose key matches the glob `pattern`, across all
    /// tiers. Returns the number of distinct keys removed.
    pub async fn invalidate(&self, pattern: &str) -> Result<usize> {
        let pattern = KeyPattern::new(pattern)?;
        let mut removed: Vec<Fingerprint> = Vec::new();
        for tier in &self.tiers {
            let keys = match tier.keys().await {
                Ok(k) => k,
                Err(e) => {
                    self.stats.io_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(tier = tier.name(), error = %e, "cache key listing failed during invalidation");
                    continue;
                }
            };
            for key in keys.into_iter().filter(|k| pattern.matches(k)) {
                match tier.remove(&key).await {
                    Ok(true) => {
                        if !removed.contains(&key) {
                            removed.push(key);
                        }
                    }
                    Ok(false) => {}
                    Err(e) => {
                        self.stats.io_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(fingerprint = %key, tier = tier.name(), error = %e, "cache invalidation failed");
                    }
                }
            }
        }
        self.stats
            .invalidations
            .fetch_add(removed.len() as u64, Ordering::Relaxed);
        debug!(pattern = pattern.as_str(), removed = removed.len(), "cache invalidated");
        Ok(removed.len())
    }

    /// Reclaim expired entries from every tier.
    pub async fn sweep_expired(&self) -> usize {
        let now = SystemTime::now();
        let mut total = 0;
        for tier in &self.tiers {
            match tier.sweep_expired(now).await {
                Ok(n) => total += n,
                Err(e) => {
                    self.stats.io_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(tier = tier.name(), error = %e, "cache sweep failed");
                }
            }
        }
        self.stats
            .expirations
            .fetch_add(total as u64, Ordering::Relaxed);
        total
    }

    pub async fn clear(&self) {
        for tier in &self.tiers {
            if let Err(e) = tier.clear().await {
                self.stats.io_errors.fetch_add(1, Ordering::Relaxed);
                warn!(tier = tier.name(), error = %e, "cache clear failed");
            }
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let mut tiers = Vec::with_capacity(self.tiers.len());
        for tier in &self.tiers {
            tiers.push(TierStats {
                kind: Some(tier.kind()),
                size: tier.len().await.unwrap_or(0),
            });
        }
        CacheStats {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            expirations: self.stats.expirations.load(Ordering::Relaxed),
            promotions: self.stats.promotions.load(Ordering::Relaxed),
            invalidations: self.stats.invalidations.load(Ordering::Relaxed),
            io_errors: self.stats.io_errors.load(Ordering::Relaxed),
            size: tiers.first().map(|t| t.size).unwrap_or(0),
            tiers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backend::DiskTier;
    use crate::Error;
    use async_trait::async_trait;
    use serde_json::json;

    fn fp(s: &str) -> Fingerprint {
        Fingerprint::from_raw(s)
    }

    /// Tier whose every operation fails.
    struct BrokenTier;

    #[async_trait]
    impl CacheTier for BrokenTier {
        fn kind(&self) -> TierKind {
            TierKind::Disk
        }
        fn name(&self) -> &'static str {
            "broken"
        }
        async fn get(&self, _: &Fingerprint) -> Result<Option<CacheEntry>> {
            Err(Error::cache_io("broken", "read"))
        }
        async fn put(&self, _: &Fingerprint, _: CacheEntry) -> Result<usize> {
            Err(Error::cache_io("broken", "write"))
        }
        async fn remove(&self, _: &Fingerprint) -> Result<bool> {
            Err(Error::cache_io("broken", "remove"))
        }
        async fn keys(&self) -> Result<Vec<Fingerprint>> {
            Err(Error::cache_io("broken", "keys"))
        }
        async fn sweep_expired(&self, _: SystemTime) -> Result<usize> {
            Err(Error::cache_io("broken", "sweep"))
        }
        async fn len(&self) -> Result<usize> {
            Ok(0)
        }
        async fn clear(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn round_trip_and_stats() {
        let store = CacheStore::memory(8);
        assert!(store.get(&fp("ec2.describe-vpcs:1")).await.is_none());
        store
            .put(&fp("ec2.describe-vpcs:1"), json!({"Vpcs": []}), Duration::from_secs(60))
            .await;
        let hit = store.get(&fp("ec2.describe-vpcs:1")).await.unwrap();
        assert_eq!(hit.value, json!({"Vpcs": []}));
        let stats = store.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
        assert!((stats.hit_ratio() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn zero_ttl_is_not_stored() {
        let store = CacheStore::memory(8);
        store.put(&fp("a.b:1"), json!(1), Duration::ZERO).await;
        assert!(store.get(&fp("a.b:1")).await.is_none());
    }

    #[tokio::test]
    async fn slower_tier_hit_is_promoted() {
        let dir = tempfile::tempdir().unwrap();
        let memory: Arc<dyn CacheTier> = Arc::new(MemoryTier::new(4));
        let disk: Arc<dyn CacheTier> = Arc::new(DiskTier::open(dir.path(), 4).await.unwrap());
        let store = CacheStore::new(vec![memory.clone(), disk.clone()], CacheStoreConfig::default());

        store.put(&fp("s.op:1"), json!("v"), Duration::from_secs(60)).await;
        memory.clear().await.unwrap();

        let entry = store.get(&fp("s.op:1")).await.unwrap();
        assert_eq!(entry.tier, TierKind::Disk);
        assert!(memory.get(&fp("s.op:1")).await.unwrap().is_some());
        assert_eq!(store.stats().await.promotions, 1);

        let entry = store.get(&fp("s.op:1")).await.unwrap();
        assert_eq!(entry.tier, TierKind::Memory);
    }

    #[tokio::test]
    async fn small_entries_stay_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let disk: Arc<dyn CacheTier> = Arc::new(DiskTier::open(dir.path(), 4).await.unwrap());
        let store = CacheStore::new(
            vec![Arc::new(MemoryTier::new(4)), disk.clone()],
            CacheStoreConfig::new().with_min_size_for_lower_tiers(100),
        );
        store.put(&fp("s.op:small"), json!(1), Duration::from_secs(60)).await;
        store
            .put(&fp("s.op:big"), json!("x".repeat(200)), Duration::from_secs(60))
            .await;
        assert_eq!(disk.keys().await.unwrap(), vec![fp("s.op:big")]);
    }

    #[tokio::test]
    async fn broken_tier_degrades_to_miss() {
        let store = CacheStore::new(
            vec![Arc::new(MemoryTier::new(4)), Arc::new(BrokenTier)],
            CacheStoreConfig::default(),
        );
        store.put(&fp("s.op:1"), json!(1), Duration::from_secs(60)).await;
        assert!(store.get(&fp("s.op:1")).await.is_some());
        assert!(store.get(&fp("s.op:2")).await.is_none());
        assert_eq!(store.invalidate("s.*").await.unwrap(), 1);
        let stats = store.stats().await;
        assert!(stats.io_errors >= 3, "io_errors = {}", stats.io_errors);
    }

    #[tokio::test]
    async fn invalidate_by_pattern_across_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(
            vec![
                Arc::new(MemoryTier::new(8)),
                Arc::new(DiskTier::open(dir.path(), 8).await.unwrap()),
            ],
            CacheStoreConfig::default(),
        );
        let ttl = Duration::from_secs(60);
        store.put(&fp("ec2.describe-instances:1"), json!(1), ttl).await;
        store.put(&fp("ec2.describe-volumes:2"), json!(2), ttl).await;
        store.put(&fp("s3api.list-buckets:3"), json!(3), ttl).await;

        assert_eq!(store.invalidate("ec2.describe-*").await.unwrap(), 2);
        assert!(store.get(&fp("ec2.describe-instances:1")).await.is_none());
        assert!(store.get(&fp("ec2.describe-volumes:2")).await.is_none());
        assert!(store.get(&fp("s3api.list-buckets:3")).await.is_some());
        assert_eq!(store.stats().await.invalidations, 2);
    }

    #[tokio::test]
    async fn evictions_are_counted() {
        let store = CacheStore::memory(2);
        let ttl = Duration::from_secs(60);
        for i in 0..5 {
            store.put(&fp(&format!("s.op:{i}")), json!(i), ttl).await;
        }
        let stats = store.stats().await;
        assert_eq!(stats.evictions, 3);
        assert_eq!(stats.size, 2);
    }

    #[tokio::test]
    async fn sweep_reclaims_expired_entries() {
        let store = CacheStore::memory(8);
        store.put(&fp("s.op:1"), json!(1), Duration::from_millis(10)).await;
        store.put(&fp("s.op:2"), json!(2), Duration::from_secs(60)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.sweep_expired().await, 1);
        assert_eq!(store.stats().await.size, 1);
    }
}
