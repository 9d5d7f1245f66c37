//! Concurrency limit convergence observed through the engine.

mod common;

use cloudcall::{BatchOptions, EngineConfig, Request};
use common::{engine_with, quiet_config, RecordingTransport};
use std::time::Duration;

fn adaptive_config(initial: usize) -> EngineConfig {
    let mut config = quiet_config();
    config.concurrency.initial_limit = initial;
    config.concurrency.min_limit = 1;
    config.concurrency.max_limit = 6;
    config.concurrency.target_latency_ms = 100;
    config.concurrency.sample_window = 4;
    config.concurrency.cooldown_ms = 0;
    config
}

fn distinct(i: usize) -> Request {
    Request::new("ec2", "describe-volumes")
        .param("volume-ids", format!("vol-{i}"))
        .no_cache()
}

#[tokio::test(start_paused = true)]
async fn fast_responses_raise_the_limit_to_max() {
    let transport = RecordingTransport::with_delay(Duration::from_millis(10));
    let engine = engine_with(adaptive_config(2), transport).await;

    let mut history = vec![engine.concurrency().current_limit()];
    for i in 0..40 {
        engine.execute(&distinct(i)).await.unwrap();
        history.push(engine.concurrency().current_limit());
    }

    assert!(history.windows(2).all(|w| w[0] <= w[1]), "{history:?}");
    assert_eq!(*history.last().unwrap(), 6);
    assert_eq!(engine.snapshot().await.concurrency.adjustments, 4);
}

#[tokio::test(start_paused = true)]
async fn slow_responses_lower_the_limit_to_min() {
    let transport = RecordingTransport::with_delay(Duration::from_millis(500));
    let engine = engine_with(adaptive_config(6), transport).await;

    let mut history = vec![engine.concurrency().current_limit()];
    for i in 0..16 {
        engine.execute(&distinct(i)).await.unwrap();
        history.push(engine.concurrency().current_limit());
    }

    assert!(history.windows(2).all(|w| w[0] >= w[1]), "{history:?}");
    assert_eq!(*history.last().unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn inflight_calls_never_exceed_the_limit() {
    let mut config = quiet_config();
    config.concurrency.initial_limit = 3;
    config.concurrency.min_limit = 3;
    config.concurrency.max_limit = 3;
    let transport = RecordingTransport::with_delay(Duration::from_millis(50));
    let engine = engine_with(config, transport.clone()).await;

    let requests: Vec<Request> = (0..12).map(distinct).collect();
    let entries = engine
        .execute_batch(requests, BatchOptions::resilient().with_concurrency(12))
        .await;

    assert!(entries.iter().all(|e| e.is_ok()));
    assert_eq!(transport.call_count(), 12);
    assert_eq!(transport.peak_inflight(), 3);
    let snapshot = engine.snapshot().await;
    assert_eq!(snapshot.concurrency.inflight_count, 0);
    assert_eq!(snapshot.concurrency.waiting, 0);
}

#[tokio::test(start_paused = true)]
async fn acquire_timeout_surfaces_as_timeout() {
    let mut config = quiet_config();
    config.concurrency.initial_limit = 1;
    config.concurrency.min_limit = 1;
    config.concurrency.max_limit = 1;
    config.concurrency.acquire_timeout_ms = Some(100);
    let transport = RecordingTransport::with_delay(Duration::from_secs(1));
    let engine = engine_with(config, transport.clone()).await;

    let first_req = distinct(0);
    let (first, second) = tokio::join!(engine.execute(&first_req), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        engine.execute(&distinct(1)).await
    });

    assert!(first.is_ok());
    let err = second.unwrap_err();
    assert!(err.is_timeout(), "{err}");
    assert_eq!(err.context().unwrap().target.as_deref(), Some("ec2.describe-volumes"));
    assert_eq!(transport.call_count(), 1);
}
