//! Fake transports shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use cloudcall::{Engine, EngineConfig, Error, Request, Result, Transport};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Echo transport: records every call, sleeps `delay`, tracks peak concurrency.
///
/// A `delay-ms` parameter overrides the delay; a `fail` parameter answers with
/// the given provider error code.
#[derive(Default)]
pub struct RecordingTransport {
    pub delay: Duration,
    calls: Mutex<Vec<Request>>,
    inflight: AtomicUsize,
    peak: AtomicUsize,
}

impl RecordingTransport {
    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<Request> {
        self.calls.lock().unwrap().clone()
    }

    pub fn peak_inflight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn name(&self) -> &str {
        "recording"
    }

    async fn call(&self, request: &Request) -> Result<Value> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(request.clone());
            calls.len()
        };
        let now = self.inflight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let delay = request
            .parameter("delay-ms")
            .and_then(|v| v.as_u64())
            .map(Duration::from_millis)
            .unwrap_or(self.delay);
        tokio::time::sleep(delay).await;
        self.inflight.fetch_sub(1, Ordering::SeqCst);

        if let Some(code) = request.parameter("fail").and_then(|v| v.as_str()) {
            return Err(Error::remote(code, "injected failure"));
        }
        Ok(json!({
            "target": request.target().to_string(),
            "parameters": request.parameters(),
            "call": n,
        }))
    }
}

/// Paginated listing of `pages * page_size` numbers, keyed by `starting-token`.
pub struct PagedTransport {
    pub pages: usize,
    pub page_size: usize,
    pub delay: Duration,
    fetches: AtomicUsize,
}

impl PagedTransport {
    pub fn new(pages: usize, page_size: usize) -> Arc<Self> {
        Arc::new(Self {
            pages,
            page_size,
            delay: Duration::from_millis(5),
            fetches: AtomicUsize::new(0),
        })
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for PagedTransport {
    async fn call(&self, request: &Request) -> Result<Value> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let page = request
            .parameter("starting-token")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(0);
        let start = page * self.page_size;
        let items: Vec<Value> = (start..start + self.page_size)
            .map(|n| json!({ "Id": n }))
            .collect();
        let next = (page + 1 < self.pages).then(|| (page + 1).to_string());
        Ok(json!({ "Items": items, "NextToken": next }))
    }
}

pub async fn engine_with(config: EngineConfig, transport: Arc<dyn Transport>) -> Engine {
    Engine::builder()
        .with_config(config)
        .with_shared_transport(transport)
        .build()
        .await
        .expect("engine builds")
}

/// Defaults with retries off, so failure counts are exact.
pub fn quiet_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.execution.max_retries = 0;
    config
}
