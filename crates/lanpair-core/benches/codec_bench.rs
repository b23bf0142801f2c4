//! Criterion benchmarks for the session frame codec.
//!
//! Run with:
//! ```bash
//! cargo bench --package lanpair-core --bench codec_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use lanpair_core::protocol::{accept_hello_frame, decode_frame, encode_frame, PairingRequest, WireMessage};
use lanpair_core::{KeyPair, SessionId};

fn make_hello() -> WireMessage {
    WireMessage::Hello(PairingRequest::new(
        SessionId::new("ABC123").unwrap(),
        KeyPair::generate().public_key(),
    ))
}

fn bench_hello(c: &mut Criterion) {
    let msg = make_hello();
    let frame = encode_frame(&msg);
    let expected = SessionId::new("ABC123").unwrap();

    c.bench_function("encode_hello", |b| b.iter(|| encode_frame(black_box(&msg))));
    c.bench_function("accept_hello", |b| {
        b.iter(|| accept_hello_frame(black_box(&expected), black_box(&frame)))
    });
}

fn bench_data(c: &mut Criterion) {
    let mut group = c.benchmark_group("data_frame");
    for size in [64usize, 4096, 65_000] {
        let frame = encode_frame(&WireMessage::Data(vec![0xA5; size]));
        group.bench_with_input(BenchmarkId::new("decode", size), &frame, |b, frame| {
            b.iter(|| decode_frame(black_box(frame)))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_hello, bench_data);
criterion_main!(benches);
