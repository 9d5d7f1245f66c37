//! 执行门面模块：组合缓存、去重、并发控制与传输层的统一入口。
//!
//! # Request Execution Facade
//!
//! [`Engine`] is the single entry point: it owns the cache store, the
//! deduplicator, the concurrency controller and the transport, and composes
//! them into `execute(request) -> result`.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`Engine`] | Cheaply cloneable handle over the shared components |
//! | [`EngineBuilder`] | Validates configuration and assembles the tiers |
//! | [`EngineSnapshot`] | Observability snapshot for metrics collaborators |
//!
//! Flow for one request: validate, cache lookup, coalesce onto an in-flight
//! twin, acquire a permit, call the transport (bounded by the call timeout,
//! retried with backoff on retryable failures), store the result, release the
//! permit. Mutations then invalidate the patterns they declare.
//!
//! ```rust
//! use cloudcall::engine::Engine;
//! use cloudcall::request::Request;
//! use cloudcall::transport;
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let engine = Engine::builder()
//!     .with_transport(transport::from_fn(|_req| async { Ok(json!({"Users": []})) }))
//!     .build()
//!     .await
//!     .unwrap();
//! let request = Request::new("iam", "list-users");
//! engine.execute(&request).await.unwrap();
//! engine.execute(&request).await.unwrap();
//! let snapshot = engine.snapshot().await;
//! assert_eq!(snapshot.cache.hits, 1);
//! assert_eq!(snapshot.requests.remote_calls, 1);
//! # });
//! ```

mod builder;
mod snapshot;

pub use builder::EngineBuilder;
pub use snapshot::{EngineSnapshot, RequestStats};

use crate::batch::{self, BatchEntry, BatchOptions};
use crate::cache::{CacheStore, KeyPattern, TtlPolicy};
use crate::config::EngineConfig;
use crate::dedup::Deduplicator;
use crate::request::{Fingerprint, Request, Target};
use crate::resilience::{ConcurrencyController, RetryPolicy};
use crate::stream::{PageFetcher, Paginator, StreamConfig};
use crate::transport::Transport;
use crate::{Error, Result};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde_json::Value;
use snapshot::AtomicRequestStats;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(crate) struct EngineInner {
    config: EngineConfig,
    cache: CacheStore,
    dedup: Deduplicator,
    concurrency: ConcurrencyController,
    transport: Arc<dyn Transport>,
    ttl: ArcSwap<TtlPolicy>,
    retry: RetryPolicy,
    call_timeout: Option<Duration>,
    stream: StreamConfig,
    shutdown: CancellationToken,
    stats: AtomicRequestStats,
}

/// Handle over one set of engine components. Clones share everything.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &CacheStore {
        &self.inner.cache
    }

    pub fn dedup(&self) -> &Deduplicator {
        &self.inner.dedup
    }

    pub fn concurrency(&self) -> &ConcurrencyController {
        &self.inner.concurrency
    }

    pub fn transport_name(&self) -> &str {
        self.inner.transport.name()
    }

    /// Execute one request through cache, dedup and concurrency control.
    pub async fn execute(&self, request: &Request) -> Result<Value> {
        self.execute_with_cancel(request, None).await
    }

    /// Like [`execute`](Self::execute). `cancel` aborts the request while it
    /// has not been dispatched yet (queued on a permit, waiting for an
    /// in-flight twin, backing off between retries). A dispatched call runs to
    /// completion.
    pub async fn execute_with_cancel(
        &self,
        request: &Request,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value> {
        let inner = &self.inner;
        inner.stats.requests.fetch_add(1, Ordering::Relaxed);
        let fingerprint = request.fingerprint();
        let result = self.run(request, &fingerprint, cancel).await;
        result.map_err(|e| {
            if e.is_cancelled() {
                inner.stats.cancelled.fetch_add(1, Ordering::Relaxed);
            } else {
                inner.stats.failures.fetch_add(1, Ordering::Relaxed);
            }
            e.with_context(
                request
                    .error_context()
                    .with_fingerprint(fingerprint.to_string()),
            )
        })
    }

    async fn run(
        &self,
        request: &Request,
        fingerprint: &Fingerprint,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value> {
        request.validate()?;
        let policy = request.cache_policy();
        let invalidations = policy
            .invalidates
            .iter()
            .map(|p| KeyPattern::new(p))
            .collect::<Result<Vec<_>>>()?;
        if is_cancelled(cancel) {
            return Err(Error::cancelled("engine"));
        }

        let value = if policy.cacheable || request.target().is_read_only() {
            self.lookup_or_coalesce(request, fingerprint, cancel).await?
        } else {
            self.call_remote(request, cancel).await?
        };

        for pattern in &invalidations {
            match self.inner.cache.invalidate(pattern.as_str()).await {
                Ok(n) => debug!(pattern = pattern.as_str(), removed = n, "invalidated after mutation"),
                Err(e) => warn!(pattern = pattern.as_str(), error = %e, "invalidation failed"),
            }
            self.inner.dedup.invalidate_recent(pattern);
        }
        Ok(value)
    }

    /// Cache hit, or the outcome of the single execution for `fingerprint`.
    ///
    /// `Cancelled` only ever reaches the caller that cancelled. When the
    /// execution this caller joined was cancelled by its own leader, the
    /// caller takes over and runs it again.
    async fn lookup_or_coalesce(
        &self,
        request: &Request,
        fingerprint: &Fingerprint,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value> {
        loop {
            if request.cache_policy().cacheable {
                if let Some(entry) = self.inner.cache.get(fingerprint).await {
                    return Ok(entry.value);
                }
            }
            let outcome = self
                .inner
                .dedup
                .dedupe_with_cancel(fingerprint, cancel, || {
                    self.fetch_and_store(request, fingerprint, cancel)
                })
                .await;
            match outcome {
                Err(e) if e.is_cancelled() && !is_cancelled(cancel) => {
                    debug!(fingerprint = %fingerprint, "shared execution cancelled by its leader, retrying");
                }
                other => return other,
            }
        }
    }

    async fn fetch_and_store(
        &self,
        request: &Request,
        fingerprint: &Fingerprint,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value> {
        let value = self.call_remote(request, cancel).await?;
        let policy = request.cache_policy();
        if policy.cacheable {
            let ttl = policy
                .ttl
                .unwrap_or_else(|| self.inner.ttl.load().resolve(request.target()));
            self.inner.cache.put(fingerprint, value.clone(), ttl).await;
        }
        Ok(value)
    }

    /// One logical remote call: permit, bounded attempt, release, maybe retry.
    async fn call_remote(&self, request: &Request, cancel: Option<&CancellationToken>) -> Result<Value> {
        let inner = &self.inner;
        let mut attempt = 0u32;
        loop {
            let permit = inner
                .concurrency
                .acquire_with_cancel(request.priority(), cancel)
                .await?;
            inner.stats.remote_calls.fetch_add(1, Ordering::Relaxed);
            let started = Instant::now();
            let outcome = match inner.call_timeout {
                Some(limit) => tokio::time::timeout(limit, inner.transport.call(request))
                    .await
                    .unwrap_or_else(|_| {
                        Err(Error::timeout(format!("remote call {}", request.target()), limit))
                    }),
                None => inner.transport.call(request).await,
            };
            let latency = started.elapsed();
            permit.release(latency);

            let err = match outcome {
                Ok(value) => {
                    debug!(target_op = %request.target(), latency_ms = latency.as_millis() as u64, "remote call succeeded");
                    return Ok(value);
                }
                Err(e) => e,
            };
            let Some(delay) = inner.retry.should_retry(attempt, &err) else {
                return Err(err);
            };
            attempt += 1;
            inner.stats.retries.fetch_add(1, Ordering::Relaxed);
            warn!(
                target_op = %request.target(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying remote call"
            );
            match cancel {
                Some(token) => tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(Error::cancelled("retry")),
                    _ = tokio::time::sleep(delay) => {}
                },
                None => tokio::time::sleep(delay).await,
            }
        }
    }

    /// Run many requests; one entry per input, in input order.
    pub async fn execute_batch(&self, requests: Vec<Request>, options: BatchOptions) -> Vec<BatchEntry> {
        batch::execute_batch(self, requests, options).await
    }

    /// Stream a paginated operation through this engine.
    pub fn paginate(&self, request: Request, items_field: impl Into<String>) -> Paginator {
        Paginator::new(Arc::new(self.clone()), request, items_field).with_config(self.inner.stream)
    }

    /// Drop cached results (and windowed dedup results) matching `pattern`.
    pub async fn invalidate(&self, pattern: &str) -> Result<usize> {
        let compiled = KeyPattern::new(pattern)?;
        self.inner.dedup.invalidate_recent(&compiled);
        self.inner.cache.invalidate(pattern).await
    }

    /// TTL the current policy assigns to `target`.
    pub fn ttl_for(&self, target: &Target) -> Duration {
        self.inner.ttl.load().resolve(target)
    }

    /// Swap the TTL policy; entries already cached keep their expiry.
    pub fn reload_ttl_policy(&self, policy: TtlPolicy) {
        info!(default_ttl_ms = policy.default_ttl().as_millis() as u64, "ttl policy reloaded");
        self.inner.ttl.store(Arc::new(policy));
    }

    pub async fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            cache: self.inner.cache.stats().await,
            concurrency: self.inner.concurrency.snapshot(),
            dedup: self.inner.dedup.stats(),
            requests: self.inner.stats.snapshot(),
        }
    }

    /// Periodically reclaim expired cache entries until [`shutdown`](Self::shutdown).
    ///
    /// Returns `None` when the sweep interval is disabled.
    pub fn spawn_maintenance(&self) -> Option<JoinHandle<()>> {
        let interval = self.inner.config.sweep_interval()?;
        let engine = self.clone();
        let shutdown = self.inner.shutdown.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let reclaimed = engine.inner.cache.sweep_expired().await;
                        if reclaimed > 0 {
                            debug!(reclaimed, "cache sweep");
                        }
                    }
                }
            }
            debug!("maintenance task stopped");
        }))
    }

    /// Stop background tasks spawned by this engine.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

fn is_cancelled(cancel: Option<&CancellationToken>) -> bool {
    cancel.map(|c| c.is_cancelled()).unwrap_or(false)
}

#[async_trait]
impl PageFetcher for Engine {
    async fn fetch_page(&self, request: &Request, cancel: &CancellationToken) -> Result<Value> {
        self.execute_with_cancel(request, Some(cancel)).await
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("transport", &self.inner.transport.name())
            .field("tiers", &self.inner.cache.tier_count())
            .field("limit", &self.inner.concurrency.current_limit())
            .finish()
    }
}
