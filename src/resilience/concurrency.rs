//! Adaptive concurrency controller.
//!
//! A permit pool whose size follows observed latency: it grows by one while
//! the windowed average stays below `target_latency` by `latency_margin`, and
//! halves when the average exceeds the target. Adjustments happen only when
//! the sample window is full and the cooldown has elapsed.

use crate::request::Priority;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    pub initial_limit: usize,
    pub min_limit: usize,
    pub max_limit: usize,
    pub target_latency: Duration,
    /// Fraction below target the average must reach before growing (0.0..1.0).
    pub latency_margin: f64,
    /// Samples averaged per adjustment decision.
    pub sample_window: usize,
    /// Minimum time between two adjustments.
    pub cooldown: Duration,
    /// Upper bound on time spent waiting for a permit.
    pub acquire_timeout: Option<Duration>,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            initial_limit: 5,
            min_limit: 1,
            max_limit: 32,
            target_latency: Duration::from_millis(1500),
            latency_margin: 0.2,
            sample_window: 10,
            cooldown: Duration::from_secs(1),
            acquire_timeout: None,
        }
    }
}

impl ConcurrencyConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_limits(mut self, initial: usize, min: usize, max: usize) -> Self {
        self.initial_limit = initial;
        self.min_limit = min;
        self.max_limit = max;
        self
    }
    pub fn with_target_latency(mut self, target: Duration) -> Self {
        self.target_latency = target;
        self
    }
    pub fn with_sample_window(mut self, n: usize) -> Self {
        self.sample_window = n;
        self
    }
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_limit == 0 {
            return Err(Error::configuration("concurrency.min_limit must be at least 1"));
        }
        if self.min_limit > self.max_limit {
            return Err(Error::configuration(format!(
                "concurrency.min_limit ({}) exceeds max_limit ({})",
                self.min_limit, self.max_limit
            )));
        }
        if self.initial_limit < self.min_limit || self.initial_limit > self.max_limit {
            return Err(Error::configuration(format!(
                "concurrency.initial_limit ({}) outside [{}, {}]",
                self.initial_limit, self.min_limit, self.max_limit
            )));
        }
        if self.sample_window == 0 {
            return Err(Error::configuration("concurrency.sample_window must be at least 1"));
        }
        if !(0.0..1.0).contains(&self.latency_margin) {
            return Err(Error::configuration("concurrency.latency_margin must be in [0, 1)"));
        }
        if self.target_latency.is_zero() {
            return Err(Error::configuration("concurrency.target_latency must be non-zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConcurrencySnapshot {
    pub current_limit: usize,
    pub inflight_count: usize,
    pub waiting: usize,
    pub min_limit: usize,
    pub max_limit: usize,
    pub target_latency_ms: u64,
    /// Average of the samples collected since the last decision.
    pub recent_average_ms: Option<u64>,
    pub adjustments: u64,
}

struct Waiter {
    id: u64,
    priority: Priority,
    tx: oneshot::Sender<Permit>,
}

struct State {
    limit: usize,
    inflight: usize,
    waiters: VecDeque<Waiter>,
    samples: VecDeque<Duration>,
    last_adjust: Option<Instant>,
    next_id: u64,
    adjustments: u64,
}

struct Inner {
    cfg: ConcurrencyConfig,
    state: Mutex<State>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// One unit of allowed concurrent execution.
///
/// Hand it back through [`Permit::release`] with the observed latency;
/// dropping it frees the slot without contributing a sample.
pub struct Permit {
    inner: Option<Arc<Inner>>,
    acquired_at: Instant,
}

impl Permit {
    fn new(inner: Arc<Inner>) -> Self {
        Self {
            inner: Some(inner),
            acquired_at: Instant::now(),
        }
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    pub fn release(mut self, observed_latency: Duration) {
        if let Some(inner) = self.inner.take() {
            release_slot(&inner, Some(observed_latency));
        }
    }

    /// Detach without touching the pool (the caller already accounted for it).
    fn disarm(mut self) {
        self.inner = None;
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            release_slot(&inner, None);
        }
    }
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit")
            .field("armed", &self.inner.is_some())
            .finish()
    }
}

fn release_slot(inner: &Arc<Inner>, sample: Option<Duration>) {
    let mut st = inner.lock();
    st.inflight = st.inflight.saturating_sub(1);
    if let Some(latency) = sample {
        record_sample(&inner.cfg, &mut st, latency);
    }
    grant_waiters(inner, &mut st);
}

fn record_sample(cfg: &ConcurrencyConfig, st: &mut State, latency: Duration) {
    st.samples.push_back(latency);
    while st.samples.len() > cfg.sample_window {
        st.samples.pop_front();
    }
    if st.samples.len() < cfg.sample_window {
        return;
    }
    if let Some(last) = st.last_adjust {
        if last.elapsed() < cfg.cooldown {
            return;
        }
    }

    let total: Duration = st.samples.iter().sum();
    let average = total / st.samples.len() as u32;
    let grow_below = cfg.target_latency.mul_f64(1.0 - cfg.latency_margin);
    let previous = st.limit;
    if average < grow_below {
        st.limit = (st.limit + 1).min(cfg.max_limit);
    } else if average > cfg.target_latency {
        st.limit = (st.limit / 2).max(cfg.min_limit);
    }
    st.samples.clear();
    st.last_adjust = Some(Instant::now());
    if st.limit != previous {
        st.adjustments += 1;
        info!(
            previous,
            limit = st.limit,
            average_ms = average.as_millis() as u64,
            "concurrency limit adjusted"
        );
    }
}

fn grant_waiters(inner: &Arc<Inner>, st: &mut State) {
    while st.inflight < st.limit {
        let Some(waiter) = st.waiters.pop_front() else {
            break;
        };
        st.inflight += 1;
        if let Err(permit) = waiter.tx.send(Permit::new(inner.clone())) {
            // Waiter gave up; dropping the permit here would re-enter the lock.
            permit.disarm();
            st.inflight -= 1;
        }
    }
}

enum WaitOutcome {
    Granted(Permit),
    Failed(Error),
}

/// Bounds and adapts the number of simultaneous outbound calls.
#[derive(Clone)]
pub struct ConcurrencyController {
    inner: Arc<Inner>,
}

impl ConcurrencyController {
    pub fn new(cfg: ConcurrencyConfig) -> Self {
        let limit = cfg.initial_limit.clamp(cfg.min_limit.max(1), cfg.max_limit.max(1));
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    limit,
                    inflight: 0,
                    waiters: VecDeque::new(),
                    samples: VecDeque::with_capacity(cfg.sample_window),
                    last_adjust: None,
                    next_id: 0,
                    adjustments: 0,
                }),
                cfg,
            }),
        }
    }

    pub fn config(&self) -> &ConcurrencyConfig {
        &self.inner.cfg
    }

    /// Wait for a permit. Waiters are served FIFO; a higher priority is queued
    /// ahead of strictly lower priorities only.
    pub async fn acquire(&self, priority: Priority) -> Result<Permit> {
        self.acquire_with_cancel(priority, None).await
    }

    pub async fn acquire_with_cancel(
        &self,
        priority: Priority,
        cancel: Option<&CancellationToken>,
    ) -> Result<Permit> {
        if cancel.map(|c| c.is_cancelled()).unwrap_or(false) {
            return Err(Error::cancelled("concurrency"));
        }

        let (id, rx) = {
            let mut st = self.inner.lock();
            if st.inflight < st.limit && st.waiters.is_empty() {
                st.inflight += 1;
                return Ok(Permit::new(self.inner.clone()));
            }
            let id = st.next_id;
            st.next_id += 1;
            let (tx, rx) = oneshot::channel();
            let pos = st
                .waiters
                .iter()
                .position(|w| w.priority < priority)
                .unwrap_or(st.waiters.len());
            st.waiters.insert(pos, Waiter { id, priority, tx });
            debug!(waiting = st.waiters.len(), limit = st.limit, "waiting for concurrency permit");
            (id, rx)
        };

        let timeout = self.inner.cfg.acquire_timeout;
        let wait = async move {
            let granted = async {
                rx.await
                    .map_err(|_| Error::runtime("concurrency controller dropped the waiter"))
            };
            match timeout {
                Some(t) => match tokio::time::timeout(t, granted).await {
                    Ok(r) => r,
                    Err(_) => Err(Error::timeout("concurrency permit", t)),
                },
                None => granted.await,
            }
        };

        let outcome = match cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => WaitOutcome::Failed(Error::cancelled("concurrency")),
                r = wait => match r {
                    Ok(p) => WaitOutcome::Granted(p),
                    Err(e) => WaitOutcome::Failed(e),
                },
            },
            None => match wait.await {
                Ok(p) => WaitOutcome::Granted(p),
                Err(e) => WaitOutcome::Failed(e),
            },
        };

        match outcome {
            WaitOutcome::Granted(p) => Ok(p),
            WaitOutcome::Failed(e) => {
                // The receiver is gone by now: a permit granted in the race
                // window was dropped with it and already returned its slot.
                self.remove_waiter(id);
                Err(e.with_context(ErrorContext::new().with_source("concurrency")))
            }
        }
    }

    fn remove_waiter(&self, id: u64) {
        let mut st = self.inner.lock();
        st.waiters.retain(|w| w.id != id);
    }

    pub fn release(&self, permit: Permit, observed_latency: Duration) {
        permit.release(observed_latency);
    }

    pub fn current_limit(&self) -> usize {
        self.inner.lock().limit
    }

    pub fn inflight_count(&self) -> usize {
        self.inner.lock().inflight
    }

    pub fn waiting_count(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    pub fn snapshot(&self) -> ConcurrencySnapshot {
        let st = self.inner.lock();
        let recent_average_ms = if st.samples.is_empty() {
            None
        } else {
            let total: Duration = st.samples.iter().sum();
            Some((total / st.samples.len() as u32).as_millis() as u64)
        };
        ConcurrencySnapshot {
            current_limit: st.limit,
            inflight_count: st.inflight,
            waiting: st.waiters.len(),
            min_limit: self.inner.cfg.min_limit,
            max_limit: self.inner.cfg.max_limit,
            target_latency_ms: self.inner.cfg.target_latency.as_millis() as u64,
            recent_average_ms,
            adjustments: st.adjustments,
        }
    }
}
