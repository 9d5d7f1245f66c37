//! 批量执行模块：按服务分组并发执行请求，按输入顺序返回结果。
//!
//! # Batch Executor
//!
//! Fans a collection of requests out across the engine and collects one
//! correlated result per input, in input order.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`execute_batch`] | Run a batch against an [`Engine`](crate::engine::Engine) |
//! | [`BatchOptions`] | Concurrency override, fail-fast, external cancellation |
//! | [`BatchEntry`] | The originating request and its value or error |
//! | [`BatchSummary`] | Counts over a finished batch |
//!
//! Requests are dispatched grouped by service (first-seen order), so calls to
//! the same service run close together. Grouping never affects the order of
//! the returned entries.
//!
//! ## Fail-fast
//!
//! With `fail_fast`, the first failure cancels every request that has not
//! been dispatched yet, including those queued for a permit; they resolve to
//! `Cancelled`. Requests already talking to the remote service drain and keep
//! their own outcome. Results that succeeded earlier are kept.

mod executor;

pub use executor::execute_batch;

use crate::request::Request;
use crate::{Error, Result};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    /// Requests admitted at once; defaults to the controller's current limit.
    pub concurrency_override: Option<usize>,
    pub fail_fast: bool,
    /// Cancels the whole batch.
    pub cancel: Option<CancellationToken>,
}

impl BatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every request runs to completion on its own.
    pub fn resilient() -> Self {
        Self::default()
    }

    pub fn fail_fast() -> Self {
        Self {
            fail_fast: true,
            ..Self::default()
        }
    }

    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency_override = Some(n.max(1));
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// One batch result, attributed to the request that produced it.
#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub request: Request,
    pub result: Result<Value>,
}

impl BatchEntry {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn value(&self) -> Option<&Value> {
        self.result.as_ref().ok()
    }

    pub fn error(&self) -> Option<&Error> {
        self.result.as_ref().err()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl BatchSummary {
    pub fn of(entries: &[BatchEntry]) -> Self {
        let mut s = Self {
            total: entries.len(),
            ..Self::default()
        };
        for entry in entries {
            match &entry.result {
                Ok(_) => s.succeeded += 1,
                Err(e) if e.is_cancelled() => s.cancelled += 1,
                Err(_) => s.failed += 1,
            }
        }
        s
    }

    pub fn all_succeeded(&self) -> bool {
        self.succeeded == self.total
    }
}
