//! Benchmarks for the request hot path
//!
//! This benchmark measures:
//! - Fingerprint computation over typical parameter maps
//! - Memory-tier lookups (hit and miss) through the cache store
//! - Glob invalidation over a populated store

use cloudcall::cache::CacheStore;
use cloudcall::request::{Fingerprint, Request};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use std::time::Duration;

fn describe_instances(i: usize) -> Request {
    Request::new("ec2", "describe-instances")
        .param("region", "eu-west-1")
        .param("instance-ids", json!([format!("i-{i:08x}")]))
        .param(
            "filters",
            json!([{ "Name": "tag:env", "Values": ["prod", "staging"] }]),
        )
}

fn bench_fingerprint(c: &mut Criterion) {
    let request = describe_instances(42);
    c.bench_function("fingerprint_describe_instances", |b| {
        b.iter(|| black_box(&request).fingerprint())
    });
}

fn bench_lookup(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("cache_lookup");

    for size in [100usize, 10_000] {
        let store = CacheStore::memory(size);
        let keys: Vec<Fingerprint> = (0..size).map(|i| describe_instances(i).fingerprint()).collect();
        rt.block_on(async {
            for key in &keys {
                store
                    .put(key, json!({ "Reservations": [] }), Duration::from_secs(600))
                    .await;
            }
        });
        let missing = describe_instances(size + 1).fingerprint();

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("hit", size), &size, |b, _| {
            let key = &keys[size / 2];
            b.to_async(&rt).iter(|| async { black_box(store.get(key).await) })
        });
        group.bench_with_input(BenchmarkId::new("miss", size), &size, |b, _| {
            b.to_async(&rt)
                .iter(|| async { black_box(store.get(&missing).await) })
        });
    }
    group.finish();
}

fn bench_invalidate(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    c.bench_function("invalidate_1000_entries", |b| {
        b.to_async(&rt).iter(|| async {
            let store = CacheStore::memory(2_000);
            for i in 0..1_000 {
                let request = if i % 2 == 0 {
                    describe_instances(i)
                } else {
                    Request::new("iam", "get-user").param("user-name", format!("user-{i}"))
                };
                store
                    .put(&request.fingerprint(), json!(i), Duration::from_secs(600))
                    .await;
            }
            black_box(store.invalidate("ec2.describe-*").await.unwrap())
        })
    });
}

criterion_group!(benches, bench_fingerprint, bench_lookup, bench_invalidate);
criterion_main!(benches);
