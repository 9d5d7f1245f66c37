use super::{BatchEntry, BatchOptions, BatchSummary};
use crate::engine::Engine;
use crate::request::Request;
use crate::{Error, Result};
use futures::StreamExt;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Execute `requests` through `engine`, returning exactly one entry per
/// request, `entries[i].request == requests[i]`.
pub async fn execute_batch(
    engine: &Engine,
    requests: Vec<Request>,
    options: BatchOptions,
) -> Vec<BatchEntry> {
    let n = requests.len();
    if n == 0 {
        return Vec::new();
    }

    let limit = options
        .concurrency_override
        .unwrap_or_else(|| engine.concurrency().current_limit())
        .max(1);
    let token = match &options.cancel {
        Some(parent) => parent.child_token(),
        None => CancellationToken::new(),
    };
    let fail_fast = options.fail_fast;
    let started = Instant::now();

    let token_ref = &token;
    let reqs = &requests;
    let results: Vec<(usize, Result<Value>)> = futures::stream::iter(dispatch_order(reqs))
        .map(|idx| async move {
            let request = &reqs[idx];
            let result = engine.execute_with_cancel(request, Some(token_ref)).await;
            if fail_fast {
                if let Err(e) = &result {
                    if !e.is_cancelled() && !token_ref.is_cancelled() {
                        warn!(index = idx, target_op = %request.target(), error = %e, "batch failing fast");
                        token_ref.cancel();
                    }
                }
            }
            (idx, result)
        })
        .buffer_unordered(limit)
        .collect()
        .await;

    let mut slots: Vec<Option<Result<Value>>> = (0..n).map(|_| None).collect();
    for (idx, result) in results {
        slots[idx] = Some(result);
    }
    let entries: Vec<BatchEntry> = requests
        .into_iter()
        .zip(slots)
        .map(|(request, slot)| BatchEntry {
            result: slot.unwrap_or_else(|| {
                Err(Error::runtime("batch result missing").with_context(request.error_context()))
            }),
            request,
        })
        .collect();

    let summary = BatchSummary::of(&entries);
    info!(
        total = summary.total,
        succeeded = summary.succeeded,
        failed = summary.failed,
        cancelled = summary.cancelled,
        limit,
        fail_fast,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "batch finished"
    );
    entries
}

/// Input indices grouped by service, groups in first-seen order.
fn dispatch_order(requests: &[Request]) -> Vec<usize> {
    let mut groups: Vec<(&str, Vec<usize>)> = Vec::new();
    for (i, request) in requests.iter().enumerate() {
        let service = request.target().service.as_str();
        match groups.iter_mut().find(|(s, _)| *s == service) {
            Some((_, members)) => members.push(i),
            None => groups.push((service, vec![i])),
        }
    }
    groups.into_iter().flat_map(|(_, members)| members).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::from_fn;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Echoes the `id` parameter after `delay_ms`; fails when `fail` is set.
    async fn echo_engine(log: Arc<Mutex<Vec<String>>>) -> Engine {
        Engine::builder()
            .with_transport(from_fn(move |req: Request| {
                let log = log.clone();
                async move {
                    log.lock().unwrap().push(req.to_string());
                    let delay = req.parameter("delay-ms").and_then(|v| v.as_u64()).unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    if req.parameter("fail").is_some() {
                        return Err(Error::remote("AccessDenied", "denied"));
                    }
                    Ok(json!({ "id": req.parameter("id").cloned() }))
                }
            }))
            .build()
            .await
            .unwrap()
    }

    #[test]
    fn groups_by_service_in_first_seen_order() {
        let reqs = vec![
            Request::new("ec2", "describe-a"),
            Request::new("s3api", "list-b"),
            Request::new("ec2", "describe-c"),
            Request::new("iam", "list-d"),
            Request::new("s3api", "list-e"),
        ];
        assert_eq!(dispatch_order(&reqs), vec![0, 2, 1, 4, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn output_order_matches_input_regardless_of_timing() {
        let engine = echo_engine(Arc::default()).await;
        let reqs: Vec<Request> = [300u64, 10, 200, 0, 50]
            .iter()
            .enumerate()
            .map(|(i, d)| {
                Request::new("ec2", "describe-thing")
                    .param("id", i)
                    .param("delay-ms", *d)
            })
            .collect();
        let entries = engine.execute_batch(reqs.clone(), BatchOptions::resilient()).await;
        assert_eq!(entries.len(), 5);
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.request, reqs[i]);
            assert_eq!(entry.value().unwrap()["id"], json!(i));
        }
    }

    #[tokio::test]
    async fn fail_fast_cancels_requests_not_started() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let engine = echo_engine(log.clone()).await;
        let reqs = vec![
            Request::new("iam", "get-user").param("id", 0),
            Request::new("iam", "get-user").param("id", 1).param("fail", true),
            Request::new("iam", "get-user").param("id", 2),
            Request::new("iam", "get-user").param("id", 3),
        ];
        let entries = engine
            .execute_batch(reqs, BatchOptions::fail_fast().with_concurrency(1))
            .await;
        assert_eq!(entries.len(), 4);
        assert!(entries[0].is_ok());
        assert!(!entries[1].error().unwrap().is_cancelled());
        assert!(entries[2].error().unwrap().is_cancelled());
        assert!(entries[3].error().unwrap().is_cancelled());
        assert_eq!(log.lock().unwrap().len(), 2);

        let summary = BatchSummary::of(&entries);
        assert_eq!(summary, BatchSummary { total: 4, succeeded: 1, failed: 1, cancelled: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn fail_fast_lets_in_flight_requests_drain() {
        let engine = echo_engine(Arc::default()).await;
        let reqs = vec![
            Request::new("iam", "get-role").param("id", 0).param("delay-ms", 100),
            Request::new("iam", "get-role").param("id", 1).param("fail", true),
            Request::new("iam", "get-role").param("id", 2),
        ];
        let entries = engine
            .execute_batch(reqs, BatchOptions::fail_fast().with_concurrency(2))
            .await;
        assert_eq!(entries[0].value().unwrap()["id"], json!(0));
        assert!(!entries[1].error().unwrap().is_cancelled());
        assert!(entries[2].error().unwrap().is_cancelled());
    }

    #[tokio::test]
    async fn external_cancel_resolves_everything_to_cancelled() {
        let engine = echo_engine(Arc::default()).await;
        let token = CancellationToken::new();
        token.cancel();
        let reqs = vec![Request::new("iam", "get-user"), Request::new("iam", "get-group")];
        let entries = engine
            .execute_batch(reqs, BatchOptions::new().with_cancel(token))
            .await;
        assert!(entries.iter().all(|e| e.error().map(|e| e.is_cancelled()).unwrap_or(false)));
    }

    #[tokio::test]
    async fn empty_batch() {
        let engine = echo_engine(Arc::default()).await;
        assert!(engine.execute_batch(Vec::new(), BatchOptions::new()).await.is_empty());
    }
}
