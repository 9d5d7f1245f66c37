//! 分页流模块：带背压的惰性分页迭代，支持取消与类型化解码。
//!
//! # Pagination / Stream Engine
//!
//! Turns a paginated remote operation into a lazy, non-restartable sequence
//! of items with bounded memory.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`Paginator`] | Describes the paged operation (items field, continuation token) |
//! | [`PageStream`] | `Stream` of raw JSON items backed by a producer task |
//! | [`TypedStream`] | Same items deserialized into `T`, see [`ItemErrorPolicy`] |
//! | [`StreamConfig`] | High/low water marks of the item buffer |
//! | [`PageFetcher`] | Where pages come from (the engine, in practice) |
//!
//! The producer fetches pages while the buffer holds fewer than `high_water`
//! items. Once it reaches `high_water` it pauses until the consumer drains
//! the buffer below `low_water`. Dropping the stream cancels the producer; a
//! page request already dispatched completes and is discarded.
//!
//! A page fetch failure is terminal: it is yielded once, after every item of
//! the earlier pages, and the stream ends.

mod paginator;

pub use paginator::{PageStream, Paginator, StreamStats, TypedStream};

use crate::request::Request;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Fetching pauses once this many items are buffered.
    pub high_water: usize,
    /// Fetching resumes below this; zero means once the buffer is empty.
    pub low_water: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            high_water: 200,
            low_water: 50,
        }
    }
}

impl StreamConfig {
    pub fn new(high_water: usize, low_water: usize) -> Self {
        Self {
            high_water,
            low_water,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.high_water == 0 {
            return Err(Error::configuration("stream.high_water must be at least 1"));
        }
        if self.low_water >= self.high_water {
            return Err(Error::configuration(format!(
                "stream.low_water ({}) must be below high_water ({})",
                self.low_water, self.high_water
            )));
        }
        Ok(())
    }
}

/// What a typed stream does with an item that fails to deserialize.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemErrorPolicy {
    /// Yield the error and keep going with the next item.
    #[default]
    Yield,
    /// Yield the error and end the stream.
    Stop,
}

/// Source of pages. Implemented by [`Engine`](crate::engine::Engine) so each
/// page goes through cache, dedup and concurrency control.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, request: &Request, cancel: &CancellationToken) -> Result<Value>;
}
