//! # cloudcall
//!
//! 面向限流云控制面 API 的请求执行引擎：分层缓存、请求合并、自适应并发与流式分页。
//!
//! A client-side acceleration layer for rate-limited, latency-variable cloud
//! control-plane APIs. Requests go through one [`Engine`] that caches results
//! in tiers, coalesces identical in-flight calls, adapts its concurrency to the
//! latency it observes and streams paginated operations with bounded memory.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cloudcall::{BatchOptions, Engine, EngineConfig, Request};
//!
//! #[tokio::main]
//! async fn main() -> cloudcall::Result<()> {
//!     cloudcall::telemetry::init_tracing();
//!     let engine = Engine::builder()
//!         .with_config(EngineConfig::from_file("cloudcall.yaml")?.apply_env())
//!         .build()
//!         .await?;
//!
//!     let regions = engine.execute(&Request::new("ec2", "describe-regions")).await?;
//!     println!("{regions}");
//!
//!     let batch = vec![
//!         Request::new("iam", "get-user").param("user-name", "alice"),
//!         Request::new("iam", "get-user").param("user-name", "bob"),
//!     ];
//!     for entry in engine.execute_batch(batch, BatchOptions::resilient()).await {
//!         println!("{} -> {:?}", entry.request, entry.result.map(|_| "ok"));
//!     }
//!     println!("{}", engine.snapshot().await);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`request`] | Request value, cache policy, priority, fingerprint |
//! | [`cache`] | Tiered cache store (memory, disk), TTL policy, glob invalidation |
//! | [`dedup`] | In-flight request coalescing with an optional reuse window |
//! | [`resilience`] | Adaptive concurrency controller and retry policy |
//! | [`batch`] | Ordered, service-grouped batch execution |
//! | [`stream`] | Pagination with backpressure |
//! | [`engine`] | The execution facade and its observability snapshot |
//! | [`transport`] | Transport trait and the provider CLI transport |
//! | [`config`] | YAML/env configuration and startup validation |
//! | [`telemetry`] | `tracing` subscriber setup |

pub mod batch;
pub mod cache;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod error_code;
pub mod request;
pub mod resilience;
pub mod stream;
pub mod telemetry;
pub mod transport;

pub use batch::{BatchEntry, BatchOptions, BatchSummary};
pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder, EngineSnapshot};
pub use error_code::StandardErrorCode;
pub use request::{CachePolicy, Fingerprint, Priority, Request, Target};
pub use stream::{ItemErrorPolicy, PageStream, Paginator};
pub use transport::{CliTransport, Transport};

use futures::Stream;
use std::pin::Pin;

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// A pinned, boxed stream of `Result<T>`
pub type BoxStream<'a, T> = Pin<Box<dyn Stream<Item = Result<T>> + Send + 'a>>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
