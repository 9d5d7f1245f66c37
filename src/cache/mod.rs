//! 分层缓存模块：内存与磁盘分层存储，支持 TTL 过期、LRU 淘汰和通配符失效。
//!
//! # Cache Store
//!
//! Tiered key→value store (memory first, then disk) with TTL expiry and strict
//! per-tier LRU eviction. It is the foundation the deduplicator and the
//! execution facade build on.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`CacheStore`] | Ordered tiers behind get/put/invalidate/sweep/stats |
//! | [`CacheTier`] | Trait every tier implements |
//! | [`MemoryTier`] | In-memory LRU tier (entry count and byte budget) |
//! | [`DiskTier`] | JSON-file tier with an in-memory LRU index |
//! | [`TtlPolicy`] | TTL resolution by target type |
//! | [`KeyPattern`] | Glob patterns used by invalidation and TTL rules |
//!
//! ## Example
//!
//! ```rust
//! use cloudcall::cache::CacheStore;
//! use cloudcall::request::Request;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let store = CacheStore::memory(1000);
//! let key = Request::new("ec2", "describe-regions").fingerprint();
//! store.put(&key, serde_json::json!({"Regions": []}), Duration::from_secs(60)).await;
//! assert!(store.get(&key).await.is_some());
//! store.invalidate("ec2.*").await.unwrap();
//! assert!(store.get(&key).await.is_none());
//! # });
//! ```
//!
//! The cache is an optimization, never a correctness dependency: tier
//! failures (corrupt files, serialization errors, lock poisoning) are logged
//! and fall back to miss/skip behavior.

mod backend;
mod manager;
mod pattern;
mod policy;

pub use backend::{estimate_size, CacheEntry, CacheTier, DiskTier, MemoryTier, TierKind};
pub use manager::{CacheStats, CacheStore, CacheStoreConfig, TierStats};
pub use pattern::KeyPattern;
pub use policy::TtlPolicy;
