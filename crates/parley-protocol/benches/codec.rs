//! Codec benchmarks for parley-protocol.

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use parley_protocol::{codec, Frame, Message};

fn frame(content_len: usize) -> Frame {
    Frame::new_message(Message::new(
        "65a1f0c2e4b0",
        "general",
        "ada@example.com",
        "x".repeat(content_len),
        Utc::now(),
    ))
}

fn bench_decode_small(c: &mut Criterion) {
    let encoded = codec::encode(&frame(64)).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("small_64B", |b| {
        b.iter(|| codec::decode(black_box(&encoded)))
    });
    group.finish();
}

fn bench_decode_batch(c: &mut Criterion) {
    let frames: Vec<Frame> = (0..32).map(|_| frame(128)).collect();
    let encoded = codec::encode_batch(&frames).unwrap();

    let mut group = c.benchmark_group("decode_batch");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("32x128B", |b| {
        b.iter(|| codec::decode_batch(black_box(&encoded), usize::MAX))
    });
    group.finish();
}

fn bench_encode(c: &mut Criterion) {
    let frame = frame(256);

    c.bench_function("encode_256B", |b| b.iter(|| codec::encode(black_box(&frame))));
}

criterion_group!(benches, bench_decode_small, bench_decode_batch, bench_encode);
criterion_main!(benches);
