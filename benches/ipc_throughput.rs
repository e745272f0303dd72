//! IPC throughput benchmark.
//!
//! Measures envelope encode/decode cost, shard routing and a full
//! request/response round trip over the memory bus using Criterion.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use jeeves_shard::ipc::{Envelope, ShardGateway};
use jeeves_shard::partition::{shard_for, shard_for_key};
use jeeves_shard::transport::MemoryBroker;
use jeeves_shard::types::{IpcConfig, ShardId};
use serde_json::json;
use std::sync::Arc;

fn payload(size: usize) -> serde_json::Value {
    json!({ "blob": "x".repeat(size) })
}

fn bench_encode(c: &mut Criterion) {
    let payload_sizes: &[usize] = &[0, 64, 1024, 4096, 65536];

    let mut group = c.benchmark_group("envelope_encode");
    for &size in payload_sizes {
        let envelope = Envelope::request(ShardId::new(0), ShardId::new(1), "bench", payload(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &envelope, |b, e| {
            b.iter(|| black_box(e).encode().unwrap());
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let payload_sizes: &[usize] = &[0, 64, 1024, 4096, 65536];

    let mut group = c.benchmark_group("envelope_decode");
    for &size in payload_sizes {
        let wire = Envelope::request(ShardId::new(0), ShardId::new(1), "bench", payload(size))
            .encode()
            .unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(size), &wire, |b, w| {
            b.iter(|| Envelope::decode(black_box(w)).unwrap());
        });
    }
    group.finish();
}

fn bench_routing(c: &mut Criterion) {
    let mut group = c.benchmark_group("routing");
    group.bench_function("shard_for", |b| {
        b.iter(|| shard_for(black_box(175928847299117063), black_box(64)));
    });
    group.bench_function("shard_for_key", |b| {
        b.iter(|| shard_for_key(black_box("tenant-4821"), black_box(64)));
    });
    group.finish();
}

fn bench_round_trip(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let broker = MemoryBroker::new();
    let (caller, callee) = rt.block_on(async {
        let caller = ShardGateway::new(ShardId::new(0), IpcConfig::default(), Arc::new(broker.connect()));
        let callee = ShardGateway::new(ShardId::new(1), IpcConfig::default(), Arc::new(broker.connect()));
        caller.initialize().await.unwrap();
        callee.initialize().await.unwrap();
        callee
            .register_handler("ping", |_, _| async { Ok::<_, String>(json!({"pong": true})) })
            .await;
        (caller, callee)
    });

    c.bench_function("request_round_trip", |b| {
        b.iter(|| {
            rt.block_on(async {
                caller
                    .request(ShardId::new(1), "ping", json!({}))
                    .await
                    .unwrap()
            })
        });
    });

    rt.block_on(async {
        caller.cleanup().await;
        callee.cleanup().await;
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_routing, bench_round_trip);
criterion_main!(benches);
