//! 引擎配置模块：YAML 加载、环境变量覆盖与启动时校验。
//!
//! # Engine configuration
//!
//! Every process-wide knob of the engine in one serde document. Values load
//! from YAML, can be overridden by `CLOUDCALL_*` environment variables and are
//! checked once at startup by [`EngineConfig::validate`].
//!
//! ```yaml
//! concurrency:
//!   initial_limit: 5
//!   max_limit: 20
//!   target_latency_ms: 1500
//! cache:
//!   memory_capacity: 2000
//!   disk_dir: /var/cache/cloudcall
//!   ttl:
//!     default_ms: 300000
//!     by_target:
//!       "ec2.describe-instances": 30000
//!       "*.list-*": 600000
//! dedup:
//!   window_ms: 250
//! stream:
//!   high_water: 500
//!   low_water: 100
//! ```

use crate::cache::{CacheStoreConfig, TtlPolicy};
use crate::resilience::{ConcurrencyConfig, RetryPolicy};
use crate::stream::StreamConfig;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub concurrency: ConcurrencySection,
    pub cache: CacheSection,
    pub dedup: DedupSection,
    pub stream: StreamSection,
    pub execution: ExecutionSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencySection {
    pub initial_limit: usize,
    pub min_limit: usize,
    pub max_limit: usize,
    pub target_latency_ms: u64,
    pub latency_margin: f64,
    pub sample_window: usize,
    pub cooldown_ms: u64,
    pub acquire_timeout_ms: Option<u64>,
}

impl Default for ConcurrencySection {
    fn default() -> Self {
        let d = ConcurrencyConfig::default();
        Self {
            initial_limit: d.initial_limit,
            min_limit: d.min_limit,
            max_limit: d.max_limit,
            target_latency_ms: d.target_latency.as_millis() as u64,
            latency_margin: d.latency_margin,
            sample_window: d.sample_window,
            cooldown_ms: d.cooldown.as_millis() as u64,
            acquire_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub enabled: bool,
    pub memory_capacity: usize,
    pub memory_max_bytes: Option<usize>,
    /// Disk tier is enabled when set.
    pub disk_dir: Option<PathBuf>,
    pub disk_capacity: usize,
    /// Entries smaller than this are kept out of the disk tier.
    pub disk_min_size_bytes: usize,
    /// Period of the background expiry sweep; zero disables it.
    pub sweep_interval_ms: u64,
    pub ttl: TtlSection,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            memory_capacity: 1000,
            memory_max_bytes: None,
            disk_dir: None,
            disk_capacity: 10_000,
            disk_min_size_bytes: 0,
            sweep_interval_ms: 60_000,
            ttl: TtlSection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlSection {
    /// Required whenever a `ttl` table is given.
    #[serde(default)]
    pub default_ms: Option<u64>,
    /// `service.operation` or glob keys.
    #[serde(default)]
    pub by_target: BTreeMap<String, u64>,
}

impl Default for TtlSection {
    fn default() -> Self {
        Self {
            default_ms: Some(300_000),
            by_target: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupSection {
    /// Completed results stay reusable this long; zero means in-flight only.
    pub window_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSection {
    pub high_water: usize,
    pub low_water: usize,
}

impl Default for StreamSection {
    fn default() -> Self {
        let d = StreamConfig::default();
        Self {
            high_water: d.high_water,
            low_water: d.low_water,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSection {
    pub call_timeout_ms: Option<u64>,
    pub max_retries: u32,
    pub retry_min_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for ExecutionSection {
    fn default() -> Self {
        let d = RetryPolicy::default();
        Self {
            call_timeout_ms: Some(120_000),
            max_retries: d.max_retries,
            retry_min_delay_ms: d.min_delay.as_millis() as u64,
            retry_max_delay_ms: d.max_delay.as_millis() as u64,
        }
    }
}

fn parse_env<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse::<T>().ok())
}

impl EngineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Apply `CLOUDCALL_*` overrides from the process environment.
    pub fn apply_env(self) -> Self {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup. Unparseable values are ignored.
    pub fn apply_env_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let c = &mut self.concurrency;
        if let Some(v) = parse_env(&lookup, "CLOUDCALL_INITIAL_LIMIT") {
            c.initial_limit = v;
        }
        if let Some(v) = parse_env(&lookup, "CLOUDCALL_MIN_LIMIT") {
            c.min_limit = v;
        }
        if let Some(v) = parse_env(&lookup, "CLOUDCALL_MAX_LIMIT") {
            c.max_limit = v;
        }
        if let Some(v) = parse_env(&lookup, "CLOUDCALL_TARGET_LATENCY_MS") {
            c.target_latency_ms = v;
        }
        if let Some(v) = parse_env(&lookup, "CLOUDCALL_ACQUIRE_TIMEOUT_MS") {
            c.acquire_timeout_ms = Some(v);
        }

        let cache = &mut self.cache;
        if let Some(v) = lookup("CLOUDCALL_CACHE_ENABLED") {
            cache.enabled = !matches!(v.trim(), "0" | "false" | "off");
        }
        if let Some(v) = parse_env(&lookup, "CLOUDCALL_MEMORY_CAPACITY") {
            cache.memory_capacity = v;
        }
        if let Some(v) = lookup("CLOUDCALL_CACHE_DIR").filter(|s| !s.trim().is_empty()) {
            cache.disk_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = parse_env(&lookup, "CLOUDCALL_DISK_CAPACITY") {
            cache.disk_capacity = v;
        }
        if let Some(v) = parse_env(&lookup, "CLOUDCALL_DEFAULT_TTL_MS") {
            cache.ttl.default_ms = Some(v);
        }

        if let Some(v) = parse_env(&lookup, "CLOUDCALL_DEDUP_WINDOW_MS") {
            self.dedup.window_ms = v;
        }
        if let Some(v) = parse_env(&lookup, "CLOUDCALL_STREAM_HIGH_WATER") {
            self.stream.high_water = v;
        }
        if let Some(v) = parse_env(&lookup, "CLOUDCALL_STREAM_LOW_WATER") {
            self.stream.low_water = v;
        }
        if let Some(v) = parse_env(&lookup, "CLOUDCALL_CALL_TIMEOUT_MS") {
            self.execution.call_timeout_ms = Some(v).filter(|ms| *ms > 0);
        }
        if let Some(v) = parse_env(&lookup, "CLOUDCALL_MAX_RETRIES") {
            self.execution.max_retries = v;
        }
        self
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.concurrency_config().validate()?;
        if self.cache.memory_capacity == 0 {
            return Err(Error::configuration("cache.memory_capacity must be at least 1"));
        }
        if self.cache.disk_dir.is_some() && self.cache.disk_capacity == 0 {
            return Err(Error::configuration("cache.disk_capacity must be at least 1"));
        }
        self.ttl_policy()?;
        self.stream_config().validate()?;
        if self.execution.retry_min_delay_ms > self.execution.retry_max_delay_ms {
            return Err(Error::configuration(
                "execution.retry_min_delay_ms exceeds retry_max_delay_ms",
            ));
        }
        Ok(())
    }

    pub fn concurrency_config(&self) -> ConcurrencyConfig {
        let c = &self.concurrency;
        ConcurrencyConfig {
            initial_limit: c.initial_limit,
            min_limit: c.min_limit,
            max_limit: c.max_limit,
            target_latency: Duration::from_millis(c.target_latency_ms),
            latency_margin: c.latency_margin,
            sample_window: c.sample_window,
            cooldown: Duration::from_millis(c.cooldown_ms),
            acquire_timeout: c.acquire_timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn cache_store_config(&self) -> CacheStoreConfig {
        CacheStoreConfig::new()
            .with_enabled(self.cache.enabled)
            .with_min_size_for_lower_tiers(self.cache.disk_min_size_bytes)
    }

    pub fn ttl_policy(&self) -> Result<TtlPolicy> {
        let ttl = &self.cache.ttl;
        let mut table: HashMap<String, Duration> = ttl
            .by_target
            .iter()
            .map(|(k, ms)| (k.clone(), Duration::from_millis(*ms)))
            .collect();
        let default_ms = ttl
            .default_ms
            .ok_or_else(|| Error::configuration("cache.ttl.default_ms is required"))?;
        table.insert("default".to_string(), Duration::from_millis(default_ms));
        TtlPolicy::from_table(&table)
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig::new(self.stream.high_water, self.stream.low_water)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.execution.max_retries).with_delays(
            Duration::from_millis(self.execution.retry_min_delay_ms),
            Duration::from_millis(self.execution.retry_max_delay_ms),
        )
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup.window_ms)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.execution.call_timeout_ms.map(Duration::from_millis)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        Some(self.cache.sweep_interval_ms)
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = EngineConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.ttl_policy().unwrap().default_ttl(), Duration::from_secs(300));
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let cfg = EngineConfig::from_yaml_str(
            r#"
concurrency:
  initial_limit: 3
  max_limit: 8
cache:
  ttl:
    default_ms: 1000
    by_target:
      "ec2.describe-instances": 50
      "*.list-*": 9000
dedup:
  window_ms: 250
"#,
        )
        .unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.concurrency.initial_limit, 3);
        assert_eq!(cfg.concurrency.min_limit, 1);
        assert_eq!(cfg.cache.memory_capacity, 1000);
        assert_eq!(cfg.dedup_window(), Duration::from_millis(250));

        let policy = cfg.ttl_policy().unwrap();
        use crate::request::Target;
        assert_eq!(
            policy.resolve(&Target::new("ec2", "describe-instances")),
            Duration::from_millis(50)
        );
        assert_eq!(
            policy.resolve(&Target::new("iam", "list-users")),
            Duration::from_millis(9000)
        );
        assert_eq!(
            policy.resolve(&Target::new("iam", "get-user")),
            Duration::from_millis(1000)
        );
    }

    #[test]
    fn ttl_table_without_default_is_fatal() {
        let cfg = EngineConfig::from_yaml_str(
            r#"
cache:
  ttl:
    by_target:
      "ec2.describe-instances": 50
"#,
        )
        .unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn invalid_limits_and_watermarks() {
        let mut cfg = EngineConfig::default();
        cfg.concurrency.min_limit = 10;
        cfg.concurrency.max_limit = 2;
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.stream.low_water = cfg.stream.high_water;
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.stream.high_water = 0;
        cfg.stream.low_water = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn malformed_yaml_is_configuration_error() {
        let err = EngineConfig::from_yaml_str("concurrency: [1, 2").unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn env_overrides() {
        let env: HashMap<&str, &str> = [
            ("CLOUDCALL_MAX_LIMIT", "12"),
            ("CLOUDCALL_DEDUP_WINDOW_MS", "75"),
            ("CLOUDCALL_CACHE_DIR", "/tmp/cc"),
            ("CLOUDCALL_MIN_LIMIT", "not-a-number"),
            ("CLOUDCALL_CALL_TIMEOUT_MS", "0"),
        ]
        .into_iter()
        .collect();
        let cfg = EngineConfig::default()
            .apply_env_from(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.concurrency.max_limit, 12);
        assert_eq!(cfg.concurrency.min_limit, 1);
        assert_eq!(cfg.dedup.window_ms, 75);
        assert_eq!(cfg.cache.disk_dir.as_deref(), Some(Path::new("/tmp/cc")));
        assert_eq!(cfg.call_timeout(), None);
    }

    #[test]
    fn from_file_reads_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        std::fs::write(&path, "stream:\n  high_water: 40\n  low_water: 10\n").unwrap();
        let cfg = EngineConfig::from_file(&path).unwrap();
        assert_eq!(cfg.stream_config().high_water, 40);
        assert!(EngineConfig::from_file(dir.path().join("missing.yaml")).is_err());
    }
}
