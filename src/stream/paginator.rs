use super::{ItemErrorPolicy, PageFetcher, StreamConfig};
use crate::request::Request;
use crate::{BoxStream, Error, ErrorContext, Result};
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::sync::Notify;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

/// A paginated operation, ready to be streamed.
///
/// ```rust,no_run
/// use cloudcall::engine::Engine;
/// use cloudcall::request::Request;
/// use futures::StreamExt;
///
/// # async fn run(engine: Engine) -> cloudcall::Result<()> {
/// let mut items = engine
///     .paginate(Request::new("ec2", "describe-instances"), "Reservations")
///     .with_page_size("max-items", 100)
///     .stream();
/// while let Some(item) = items.next().await {
///     println!("{}", item?);
/// }
/// # Ok(())
/// # }
/// ```
pub struct Paginator {
    fetcher: Arc<dyn PageFetcher>,
    request: Request,
    shape: PageShape,
    config: StreamConfig,
    item_errors: ItemErrorPolicy,
    cancel: Option<CancellationToken>,
}

#[derive(Debug, Clone)]
struct PageShape {
    items_field: String,
    token_param: String,
    token_field: String,
    page_size: Option<(String, usize)>,
}

impl PageShape {
    fn page_request(&self, base: &Request, token: Option<&Value>) -> Request {
        let mut request = base.clone();
        if let Some(token) = token {
            request = request.param(self.token_param.clone(), token.clone());
        }
        if let Some((param, size)) = &self.page_size {
            request = request.param(param.clone(), *size);
        }
        request
    }

    /// Split a page into its items and the continuation token, if any.
    fn split_page(&self, page: Value) -> Result<(Vec<Value>, Option<Value>)> {
        let mut map = match page {
            Value::Object(map) => map,
            Value::Null => return Ok((Vec::new(), None)),
            other => {
                return Err(Error::validation(format!(
                    "page is not an object (got {})",
                    json_kind(&other)
                )))
            }
        };
        let items = match map.remove(&self.items_field) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items,
            Some(other) => {
                return Err(Error::validation(format!(
                    "page field '{}' is not an array (got {})",
                    self.items_field,
                    json_kind(&other)
                )))
            }
        };
        let token = match map.remove(&self.token_field) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.is_empty() => None,
            Some(token) => Some(token),
        };
        Ok((items, token))
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl Paginator {
    /// `items_field` names the array holding each page's items.
    pub fn new(fetcher: Arc<dyn PageFetcher>, request: Request, items_field: impl Into<String>) -> Self {
        Self {
            fetcher,
            request,
            shape: PageShape {
                items_field: items_field.into(),
                token_param: "starting-token".to_string(),
                token_field: "NextToken".to_string(),
                page_size: None,
            },
            config: StreamConfig::default(),
            item_errors: ItemErrorPolicy::default(),
            cancel: None,
        }
    }

    /// Request parameter carrying the continuation token.
    pub fn with_token_param(mut self, param: impl Into<String>) -> Self {
        self.shape.token_param = param.into();
        self
    }

    /// Response field holding the continuation token.
    pub fn with_token_field(mut self, field: impl Into<String>) -> Self {
        self.shape.token_field = field.into();
        self
    }

    pub fn with_page_size(mut self, param: impl Into<String>, size: usize) -> Self {
        self.shape.page_size = Some((param.into(), size.max(1)));
        self
    }

    pub fn with_config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_item_errors(mut self, policy: ItemErrorPolicy) -> Self {
        self.item_errors = policy;
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Start producing. Must be called within a Tokio runtime.
    pub fn stream(self) -> PageStream {
        let cancel = match &self.cancel {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        // Keep the marks usable even if the config skipped validation.
        let high = self.config.high_water.max(1);
        let config = StreamConfig::new(high, self.config.low_water.min(high - 1));

        let shared = Arc::new(Shared::default());
        tokio::spawn(produce(
            shared.clone(),
            self.fetcher,
            self.request,
            self.shape,
            config,
            cancel.clone(),
        ));

        let consumer = Consumer {
            shared: shared.clone(),
            cancel: cancel.clone(),
            _guard: cancel.drop_guard(),
            done: false,
        };
        let inner: BoxStream<'static, Value> = Box::pin(futures::stream::unfold(consumer, pull).fuse());
        PageStream { inner, shared }
    }

    /// Items deserialized into `T`; decode failures follow the configured
    /// [`ItemErrorPolicy`].
    pub fn items<T: DeserializeOwned>(self) -> TypedStream<T> {
        let policy = self.item_errors;
        TypedStream {
            inner: self.stream(),
            policy,
            index: 0,
            done: false,
            _marker: PhantomData,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub pages_fetched: u64,
    pub items_fetched: u64,
    pub buffered_items: usize,
    pub max_buffered_items: usize,
    /// Most pages with at least one item resident in the buffer at once.
    pub max_buffered_pages: usize,
}

#[derive(Default)]
struct Buffer {
    /// Items tagged with the page they came from.
    items: VecDeque<(u64, Value)>,
    /// `Some(Ok)` once exhausted, `Some(Err)` once a page fetch failed.
    finished: Option<Result<()>>,
    stats: StreamStats,
}

#[derive(Default)]
struct Shared {
    buffer: Mutex<Buffer>,
    item_ready: Notify,
    drained: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Buffer> {
        self.buffer.lock().unwrap_or_else(|p| p.into_inner())
    }
}

async fn produce(
    shared: Arc<Shared>,
    fetcher: Arc<dyn PageFetcher>,
    base: Request,
    shape: PageShape,
    config: StreamConfig,
    cancel: CancellationToken,
) {
    let mut token: Option<Value> = None;
    let mut page_no = 0u64;
    let mut filling = true;

    loop {
        loop {
            let drained = shared.drained.notified();
            let has_room = {
                let buf = shared.lock();
                let len = buf.items.len();
                if len < config.low_water || len == 0 {
                    filling = true;
                } else if len >= config.high_water {
                    filling = false;
                }
                filling
            };
            if has_room {
                break;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = drained => {}
            }
        }
        if cancel.is_cancelled() {
            return;
        }

        let request = shape.page_request(&base, token.as_ref());
        let outcome = fetcher.fetch_page(&request, &cancel).await;
        if cancel.is_cancelled() {
            debug!(target_op = %base.target(), page = page_no + 1, "stream cancelled, page discarded");
            return;
        }

        let finished = {
            let mut buf = shared.lock();
            match outcome.and_then(|page| shape.split_page(page)) {
                Ok((items, next)) => {
                    page_no += 1;
                    buf.stats.pages_fetched += 1;
                    buf.stats.items_fetched += items.len() as u64;
                    buf.items.extend(items.into_iter().map(|item| (page_no, item)));
                    record_high_marks(&mut buf);
                    match next {
                        Some(next) if token.as_ref() == Some(&next) => {
                            buf.finished = Some(Err(Error::runtime(
                                "pagination token did not advance",
                            )
                            .with_context(base.error_context())));
                        }
                        Some(next) => token = Some(next),
                        None => buf.finished = Some(Ok(())),
                    }
                }
                Err(e) => {
                    warn!(target_op = %base.target(), page = page_no + 1, error = %e, "page fetch failed");
                    buf.finished = Some(Err(e.with_context(base.error_context())));
                }
            }
            buf.finished.is_some()
        };
        shared.item_ready.notify_one();
        if finished {
            debug!(target_op = %base.target(), pages = page_no, "pagination finished");
            return;
        }
    }
}

fn record_high_marks(buf: &mut Buffer) {
    let len = buf.items.len();
    buf.stats.max_buffered_items = buf.stats.max_buffered_items.max(len);
    if let (Some((first, _)), Some((last, _))) = (buf.items.front(), buf.items.back()) {
        let pages = (last - first + 1) as usize;
        buf.stats.max_buffered_pages = buf.stats.max_buffered_pages.max(pages);
    }
}

struct Consumer {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    /// Cancels the producer when the stream is dropped.
    _guard: DropGuard,
    done: bool,
}

enum Pull {
    Item(Value),
    Failed(Error),
    End,
    Wait,
}

async fn pull(mut c: Consumer) -> Option<(Result<Value>, Consumer)> {
    if c.done {
        return None;
    }
    loop {
        if c.cancel.is_cancelled() {
            c.done = true;
            return Some((Err(Error::cancelled("stream")), c));
        }
        let next = {
            let mut buf = c.shared.lock();
            if let Some((_, item)) = buf.items.pop_front() {
                Pull::Item(item)
            } else {
                match buf.finished.take() {
                    Some(Err(e)) => Pull::Failed(e),
                    Some(Ok(())) => Pull::End,
                    None => Pull::Wait,
                }
            }
        };
        match next {
            Pull::Item(item) => {
                c.shared.drained.notify_one();
                return Some((Ok(item), c));
            }
            Pull::Failed(e) => {
                c.done = true;
                return Some((Err(e), c));
            }
            Pull::End => return None,
            Pull::Wait => {
                // notify_one keeps a permit, so a page landing before this
                // point still wakes us.
                tokio::select! {
                    _ = c.shared.item_ready.notified() => {}
                    _ = c.cancel.cancelled() => {}
                }
            }
        }
    }
}

/// Lazily produced items of a paginated operation.
pub struct PageStream {
    inner: BoxStream<'static, Value>,
    shared: Arc<Shared>,
}

impl PageStream {
    pub fn stats(&self) -> StreamStats {
        let buf = self.shared.lock();
        StreamStats {
            buffered_items: buf.items.len(),
            ..buf.stats.clone()
        }
    }
}

impl Stream for PageStream {
    type Item = Result<Value>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

/// [`PageStream`] items deserialized into `T`.
pub struct TypedStream<T> {
    inner: PageStream,
    policy: ItemErrorPolicy,
    index: usize,
    done: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypedStream<T> {
    pub fn stats(&self) -> StreamStats {
        self.inner.stats()
    }
}

impl<T: DeserializeOwned> Stream for TypedStream<T> {
    type Item = Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match futures::ready!(self.inner.poll_next_unpin(cx)) {
            None => {
                self.done = true;
                Poll::Ready(None)
            }
            Some(Err(e)) => {
                self.done = true;
                Poll::Ready(Some(Err(e)))
            }
            Some(Ok(value)) => {
                let index = self.index;
                self.index += 1;
                match serde_json::from_value::<T>(value) {
                    Ok(item) => Poll::Ready(Some(Ok(item))),
                    Err(e) => {
                        if self.policy == ItemErrorPolicy::Stop {
                            self.done = true;
                        }
                        Poll::Ready(Some(Err(Error::validation(format!(
                            "item {} does not match the expected shape: {}",
                            index, e
                        ))
                        .with_context(ErrorContext::new().with_source("stream")))))
                    }
                }
            }
        }
    }
}
