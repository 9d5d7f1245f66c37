//! 传输层模块：远程调用抽象与云厂商 CLI 子进程实现。
//!
//! # Transport
//!
//! The seam between the engine and the remote service. The engine never
//! talks to the provider directly: it hands a validated [`Request`] to a
//! [`Transport`] and gets back the JSON payload or an [`Error`](crate::Error).
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`Transport`] | Async trait every backend implements |
//! | [`CliTransport`] | Invokes the provider CLI as a subprocess |
//! | [`FnTransport`] | Adapts an async closure (embedding, tests) |

mod cli;

pub use cli::CliTransport;

use crate::request::Request;
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// Performs one remote call. Implementations must support many simultaneous
/// independent calls; the engine bounds how many are issued.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str {
        "transport"
    }

    async fn call(&self, request: &Request) -> Result<Value>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn call(&self, request: &Request) -> Result<Value> {
        (**self).call(request).await
    }
}

/// A transport backed by an async closure over an owned request.
pub struct FnTransport<F> {
    name: String,
    f: F,
}

impl<F, Fut> FnTransport<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> Transport for FnTransport<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, request: &Request) -> Result<Value> {
        (self.f)(request.clone()).await
    }
}

/// Shorthand for [`FnTransport::new`].
pub fn from_fn<F, Fut>(f: F) -> FnTransport<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    FnTransport::new("fn", f)
}
