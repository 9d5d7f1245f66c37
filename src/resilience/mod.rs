//! 弹性模块：基于延迟自适应的并发控制与指数退避重试。
//!
//! # Resilience
//!
//! Outbound-call protection for rate-limited control-plane APIs.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`ConcurrencyController`] | Latency-adaptive permit pool with FIFO/priority waiters |
//! | [`RetryPolicy`] | Capped exponential backoff for retryable remote errors |
//!
//! ```rust
//! use cloudcall::request::Priority;
//! use cloudcall::resilience::{ConcurrencyConfig, ConcurrencyController};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let controller = ConcurrencyController::new(
//!     ConcurrencyConfig::new()
//!         .with_limits(5, 1, 20)
//!         .with_target_latency(Duration::from_millis(800)),
//! );
//! let permit = controller.acquire(Priority::Normal).await.unwrap();
//! // ... perform the call ...
//! controller.release(permit, Duration::from_millis(120));
//! assert_eq!(controller.inflight_count(), 0);
//! # });
//! ```

mod concurrency;
mod retry;

pub use concurrency::{ConcurrencyConfig, ConcurrencyController, ConcurrencySnapshot, Permit};
pub use retry::RetryPolicy;
