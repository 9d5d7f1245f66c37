use super::{snapshot::AtomicRequestStats, Engine, EngineInner};
use crate::cache::{CacheStore, CacheTier, DiskTier, MemoryTier};
use crate::config::EngineConfig;
use crate::dedup::Deduplicator;
use crate::resilience::ConcurrencyController;
use crate::transport::{CliTransport, Transport};
use crate::Result;
use arc_swap::ArcSwap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Assembles an [`Engine`] from an [`EngineConfig`].
///
/// Configuration errors surface here, at startup, never per request.
pub struct EngineBuilder {
    config: EngineConfig,
    transport: Option<Arc<dyn Transport>>,
    tiers: Option<Vec<Arc<dyn CacheTier>>>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            transport: None,
            tiers: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Apply `CLOUDCALL_*` environment overrides to the current config.
    pub fn with_env_overrides(mut self) -> Self {
        self.config = self.config.apply_env();
        self
    }

    /// Defaults to [`CliTransport`] when not set.
    pub fn with_transport(self, transport: impl Transport + 'static) -> Self {
        self.with_shared_transport(Arc::new(transport))
    }

    pub fn with_shared_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Replace the tiers derived from the cache section (fastest first).
    pub fn with_cache_tiers(mut self, tiers: Vec<Arc<dyn CacheTier>>) -> Self {
        self.tiers = Some(tiers);
        self
    }

    pub async fn build(self) -> Result<Engine> {
        let config = self.config;
        config.validate()?;
        let ttl = config.ttl_policy()?;

        let tiers = match self.tiers {
            Some(tiers) => tiers,
            None => Self::tiers_from(&config).await,
        };
        let cache = CacheStore::new(tiers, config.cache_store_config());
        let transport: Arc<dyn Transport> = match self.transport {
            Some(t) => t,
            None => Arc::new(CliTransport::default()),
        };

        info!(
            transport = transport.name(),
            tiers = cache.tier_count(),
            initial_limit = config.concurrency.initial_limit,
            dedup_window_ms = config.dedup.window_ms,
            "engine ready"
        );

        Ok(Engine {
            inner: Arc::new(EngineInner {
                cache,
                dedup: Deduplicator::new(config.dedup_window()),
                concurrency: ConcurrencyController::new(config.concurrency_config()),
                transport,
                ttl: ArcSwap::from_pointee(ttl),
                retry: config.retry_policy(),
                call_timeout: config.call_timeout(),
                stream: config.stream_config(),
                shutdown: CancellationToken::new(),
                stats: AtomicRequestStats::default(),
                config,
            }),
        })
    }

    async fn tiers_from(config: &EngineConfig) -> Vec<Arc<dyn CacheTier>> {
        let section = &config.cache;
        let mut memory = MemoryTier::new(section.memory_capacity);
        if let Some(bytes) = section.memory_max_bytes {
            memory = memory.with_max_bytes(bytes);
        }
        let mut tiers: Vec<Arc<dyn CacheTier>> = vec![Arc::new(memory)];
        if let Some(dir) = &section.disk_dir {
            // Memory-only when the directory is unusable.
            match DiskTier::open(dir, section.disk_capacity).await {
                Ok(disk) => tiers.push(Arc::new(disk)),
                Err(e) => warn!(dir = %dir.display(), error = %e, "disk cache tier disabled"),
            }
        }
        tiers
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::from_fn;
    use crate::Error;
    use serde_json::json;

    #[tokio::test]
    async fn invalid_config_fails_at_build() {
        let mut cfg = EngineConfig::default();
        cfg.concurrency.initial_limit = 0;
        let err = Engine::builder().with_config(cfg).build().await.unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[tokio::test]
    async fn disk_dir_adds_second_tier() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = EngineConfig::default();
        cfg.cache.disk_dir = Some(dir.path().to_path_buf());
        let engine = Engine::builder()
            .with_config(cfg)
            .with_transport(from_fn(|_req| async { Ok(json!({"Zones": [1, 2, 3]})) }))
            .build()
            .await
            .unwrap();
        assert_eq!(engine.cache().tier_count(), 2);
        engine
            .execute(&crate::request::Request::new("ec2", "describe-availability-zones"))
            .await
            .unwrap();
        let stats = engine.snapshot().await.cache;
        assert_eq!(stats.tiers.len(), 2);
        assert_eq!(stats.tiers[1].size, 1);
    }

    #[tokio::test]
    async fn defaults_to_cli_transport() {
        let engine = Engine::builder().build().await.unwrap();
        assert_eq!(engine.transport_name(), "cli");
    }
}
