use crate::cache::CacheStats;
use crate::dedup::DedupStats;
use crate::resilience::ConcurrencySnapshot;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Facts only: what the engine has done so far, for a metrics collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineSnapshot {
    pub cache: CacheStats,
    pub concurrency: ConcurrencySnapshot,
    pub dedup: DedupStats,
    pub requests: RequestStats,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RequestStats {
    /// Calls to `execute`, including cache hits.
    pub requests: u64,
    /// Transport invocations, retries included.
    pub remote_calls: u64,
    pub retries: u64,
    pub failures: u64,
    pub cancelled: u64,
}

#[derive(Debug, Default)]
pub(crate) struct AtomicRequestStats {
    pub(crate) requests: AtomicU64,
    pub(crate) remote_calls: AtomicU64,
    pub(crate) retries: AtomicU64,
    pub(crate) failures: AtomicU64,
    pub(crate) cancelled: AtomicU64,
}

impl AtomicRequestStats {
    pub(crate) fn snapshot(&self) -> RequestStats {
        RequestStats {
            requests: self.requests.load(Ordering::Relaxed),
            remote_calls: self.remote_calls.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Display for EngineSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cache hits={} misses={} evictions={} size={} | concurrency limit={} inflight={} waiting={} | dedup coalesced={} | remote_calls={} retries={} failures={}",
            self.cache.hits,
            self.cache.misses,
            self.cache.evictions,
            self.cache.size,
            self.concurrency.current_limit,
            self.concurrency.inflight_count,
            self.concurrency.waiting,
            self.dedup.coalesced_count,
            self.requests.remote_calls,
            self.requests.retries,
            self.requests.failures,
        )
    }
}
