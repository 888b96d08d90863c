// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire codec benchmarks: sample envelope encode/decode at typical payload
//! sizes.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use hbus::wire::SampleEnvelope;
use hbus::TopicId;

fn envelope(payload_len: usize) -> SampleEnvelope {
    SampleEnvelope::new(
        TopicId {
            host_name: "bench-host".into(),
            process_id: 4711,
            serial: 3,
        },
        "bench/topic".into(),
        42,
        1_700_000_000_000_000,
        vec![0xA5; payload_len],
    )
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope_encode");
    for size in [1024usize, 64 * 1024] {
        let env = envelope(size);
        group.bench_function(format!("{}B", size), |b| {
            b.iter(|| black_box(env.encode_record()));
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope_decode");
    for size in [1024usize, 64 * 1024] {
        let body = envelope(size).encode_body();
        group.bench_function(format!("{}B", size), |b| {
            b.iter(|| black_box(SampleEnvelope::decode_body(&body).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
