//! Codec benchmarks for relay-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use relay_protocol::{Encoding, Envelope, FrameCodec};
use serde_json::json;

fn sample(len: usize) -> Envelope {
    Envelope::event("message_create", json!({ "content": "x".repeat(len) }))
}

fn bench_encode_json(c: &mut Criterion) {
    let envelope = sample(64);
    let mut codec = FrameCodec::new(Encoding::Json);

    let mut group = c.benchmark_group("encode_json");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("small_64B", |b| b.iter(|| codec.encode(black_box(&envelope))));
    group.finish();
}

fn bench_encode_zlib(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_zlib");
    for len in [64usize, 4096] {
        let envelope = sample(len);
        // One long-lived stream, the way a connection uses it.
        let mut codec = FrameCodec::new(Encoding::Zlib);
        group.throughput(Throughput::Bytes(len as u64));
        group.bench_function(format!("{len}B"), |b| {
            b.iter(|| codec.encode(black_box(&envelope)))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode_json, bench_encode_zlib);
criterion_main!(benches);
