//! 请求去重模块：合并相同指纹的并发请求，只执行一次远程调用。
//!
//! # Deduplicator
//!
//! Coalesces concurrent identical requests: the first caller for a
//! [`Fingerprint`] runs the executor, every later caller registers as a waiter
//! and receives a clone of the very same outcome, success or failure.
//!
//! With a non-zero coalescing `window`, a successful result also stays
//! reusable for `window` after it completed, so a burst of identical requests
//! arriving just after one another still costs a single execution.
//!
//! ```rust
//! use cloudcall::dedup::Deduplicator;
//! use cloudcall::request::Request;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let dedup = Deduplicator::new(Duration::ZERO);
//! let key = Request::new("iam", "list-users").fingerprint();
//! let value = dedup
//!     .dedupe(&key, || async { Ok(serde_json::json!({"Users": []})) })
//!     .await
//!     .unwrap();
//! assert_eq!(value["Users"], serde_json::json!([]));
//! assert_eq!(dedup.stats().executions, 1);
//! # });
//! ```

use crate::cache::KeyPattern;
use crate::request::Fingerprint;
use crate::{Error, ErrorContext, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type Waiters = Vec<oneshot::Sender<Result<Value>>>;

#[derive(Default)]
struct State {
    inflight: HashMap<Fingerprint, Waiters>,
    recent: HashMap<Fingerprint, (Instant, Value)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DedupStats {
    /// Executor invocations.
    pub executions: u64,
    /// Callers served by someone else's execution (in-flight or windowed).
    pub coalesced_count: u64,
    /// Subset of `coalesced_count` served from the completion window.
    pub window_hits: u64,
    /// Fingerprints currently executing.
    pub inflight: usize,
}

pub struct Deduplicator {
    state: Mutex<State>,
    window: Duration,
    executions: AtomicU64,
    coalesced: AtomicU64,
    window_hits: AtomicU64,
}

enum Role {
    Leader,
    Follower(oneshot::Receiver<Result<Value>>),
    Reused(Value),
}

impl Deduplicator {
    pub fn new(window: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            window,
            executions: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            window_hits: AtomicU64::new(0),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // No cross-map invariant; a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Run `executor` unless an identical execution is in flight (or finished
    /// within the window), in which case its outcome is shared.
    pub async fn dedupe<F, Fut>(&self, key: &Fingerprint, executor: F) -> Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        self.dedupe_with_cancel(key, None, executor).await
    }

    /// Like [`dedupe`](Self::dedupe), but a waiter stops waiting with
    /// `Cancelled` once `cancel` fires. The leader's executor is expected to
    /// observe the token itself.
    pub async fn dedupe_with_cancel<F, Fut>(
        &self,
        key: &Fingerprint,
        cancel: Option<&CancellationToken>,
        executor: F,
    ) -> Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        let role = {
            let mut st = self.lock();
            let reusable = if self.window.is_zero() {
                None
            } else {
                st.recent
                    .get(key)
                    .filter(|(at, _)| at.elapsed() <= self.window)
                    .map(|(_, v)| v.clone())
            };
            if let Some(value) = reusable {
                Role::Reused(value)
            } else if let Some(waiters) = st.inflight.get_mut(key) {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Role::Follower(rx)
            } else {
                st.inflight.insert(key.clone(), Vec::new());
                Role::Leader
            }
        };

        match role {
            Role::Reused(value) => {
                self.coalesced.fetch_add(1, Ordering::Relaxed);
                self.window_hits.fetch_add(1, Ordering::Relaxed);
                debug!(fingerprint = %key, "served from dedup window");
                Ok(value)
            }
            Role::Follower(rx) => {
                self.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(fingerprint = %key, "coalesced onto in-flight execution");
                let cancelled = || {
                    Err(Error::cancelled("dedup")
                        .with_context(ErrorContext::new().with_fingerprint(key.to_string())))
                };
                // A dropped sender means the leader was cancelled or panicked.
                match cancel {
                    Some(token) => tokio::select! {
                        biased;
                        _ = token.cancelled() => cancelled(),
                        r = rx => r.unwrap_or_else(|_| cancelled()),
                    },
                    None => rx.await.unwrap_or_else(|_| cancelled()),
                }
            }
            Role::Leader => {
                self.executions.fetch_add(1, Ordering::Relaxed);
                let guard = LeaderGuard {
                    dedup: self,
                    key,
                    armed: true,
                };
                let result = executor().await;
                guard.publish(&result);
                result
            }
        }
    }

    /// Forget windowed results whose key matches `pattern`.
    pub fn invalidate_recent(&self, pattern: &KeyPattern) -> usize {
        let mut st = self.lock();
        let before = st.recent.len();
        st.recent.retain(|k, _| !pattern.matches(k));
        before - st.recent.len()
    }

    pub fn inflight_count(&self) -> usize {
        self.lock().inflight.len()
    }

    pub fn stats(&self) -> DedupStats {
        DedupStats {
            executions: self.executions.load(Ordering::Relaxed),
            coalesced_count: self.coalesced.load(Ordering::Relaxed),
            window_hits: self.window_hits.load(Ordering::Relaxed),
            inflight: self.inflight_count(),
        }
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

/// Removes the in-flight entry even when the leader future is dropped.
/// Waiters then observe their sender closing and resolve to `Cancelled`.
struct LeaderGuard<'a> {
    dedup: &'a Deduplicator,
    key: &'a Fingerprint,
    armed: bool,
}

impl LeaderGuard<'_> {
    fn publish(mut self, result: &Result<Value>) {
        self.armed = false;
        let waiters = {
            let mut st = self.dedup.lock();
            let waiters = st.inflight.remove(self.key).unwrap_or_default();
            if !self.dedup.window.is_zero() {
                let window = self.dedup.window;
                st.recent.retain(|_, (at, _)| at.elapsed() <= window);
                if let Ok(value) = result {
                    st.recent
                        .insert(self.key.clone(), (Instant::now(), value.clone()));
                }
            }
            waiters
        };
        // Registration order.
        for tx in waiters {
            let _ = tx.send(result.clone());
        }
    }
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.dedup.lock().inflight.remove(self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn key(s: &str) -> Fingerprint {
        Fingerprint::from_raw(format!("svc.op:{s}"))
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_execution() {
        let dedup = Arc::new(Deduplicator::new(Duration::ZERO));
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let dedup = dedup.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                dedup
                    .dedupe(&key("a"), || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok(json!("shared"))
                    })
                    .await
            }));
        }
        let started = Instant::now();
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), json!("shared"));
        }
        assert!(started.elapsed() < Duration::from_millis(300));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = dedup.stats();
        assert_eq!(stats.executions, 1);
        assert_eq!(stats.coalesced_count, 2);
        assert_eq!(stats.inflight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_receive_the_same_failure() {
        let dedup = Arc::new(Deduplicator::new(Duration::ZERO));
        let leader = {
            let dedup = dedup.clone();
            tokio::spawn(async move {
                dedup
                    .dedupe(&key("e"), || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err(Error::remote("AccessDenied", "nope"))
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        let follower = dedup
            .dedupe(&key("e"), || async { Ok(json!("never runs")) })
            .await;
        let leader = leader.await.unwrap();
        for res in [leader, follower] {
            match res {
                Err(Error::Remote { code, .. }) => assert_eq!(code, "AccessDenied"),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(dedup.stats().executions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_calls_without_window_execute_again() {
        let dedup = Deduplicator::new(Duration::ZERO);
        let calls = AtomicUsize::new(0);
        for _ in 0..2 {
            dedup
                .dedupe(&key("s"), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(1))
                })
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn window_reuses_recent_result_until_it_elapses() {
        let dedup = Deduplicator::new(Duration::from_millis(100));
        let calls = AtomicUsize::new(0);
        let run = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!(calls.load(Ordering::SeqCst)))
        };

        assert_eq!(dedup.dedupe(&key("w"), run).await.unwrap(), json!(1));
        tokio::time::advance(Duration::from_millis(50)).await;
        assert_eq!(dedup.dedupe(&key("w"), run).await.unwrap(), json!(1));
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(dedup.dedupe(&key("w"), run).await.unwrap(), json!(2));
        assert_eq!(dedup.stats().window_hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn window_does_not_retain_failures() {
        let dedup = Deduplicator::new(Duration::from_secs(10));
        let first = dedup
            .dedupe(&key("f"), || async { Err(Error::remote("InternalError", "boom")) })
            .await;
        assert!(first.is_err());
        let second = dedup.dedupe(&key("f"), || async { Ok(json!("ok")) }).await;
        assert_eq!(second.unwrap(), json!("ok"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_leader_releases_waiters() {
        let dedup = Arc::new(Deduplicator::new(Duration::ZERO));
        let leader = {
            let dedup = dedup.clone();
            tokio::spawn(async move {
                dedup
                    .dedupe(&key("c"), || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(json!("late"))
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        let follower = {
            let dedup = dedup.clone();
            tokio::spawn(async move { dedup.dedupe(&key("c"), || async { Ok(json!(0)) }).await })
        };
        tokio::task::yield_now().await;
        leader.abort();
        let res = follower.await.unwrap();
        assert!(res.unwrap_err().is_cancelled());
        assert_eq!(dedup.inflight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_waiter_leaves_leader_running() {
        let dedup = Arc::new(Deduplicator::new(Duration::ZERO));
        let leader = {
            let dedup = dedup.clone();
            tokio::spawn(async move {
                dedup
                    .dedupe(&key("w"), || async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(json!("done"))
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        let token = CancellationToken::new();
        token.cancel();
        let res = dedup
            .dedupe_with_cancel(&key("w"), Some(&token), || async { Ok(json!(0)) })
            .await;
        assert!(res.unwrap_err().is_cancelled());
        assert_eq!(leader.await.unwrap().unwrap(), json!("done"));
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_recent_by_pattern() {
        let dedup = Deduplicator::new(Duration::from_secs(10));
        dedup.dedupe(&key("x"), || async { Ok(json!(1)) }).await.unwrap();
        let pattern = KeyPattern::new("svc.*").unwrap();
        assert_eq!(dedup.invalidate_recent(&pattern), 1);
    }
}
