//! Criterion benchmarks for the stream chunker.
//!
//! Measures frame extraction from a serial-sized read containing a mix of
//! velocity records, a system record, and line noise.
//!
//! Run with:
//! ```bash
//! cargo bench --package nortek-core --bench chunker_bench
//! ```

use std::collections::VecDeque;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use nortek_core::protocol::chunker::{Sieve, StreamChunker};
use nortek_core::protocol::codec::seal_checksum;
use nortek_core::VECTOR;

fn velocity(counter: u8) -> Vec<u8> {
    let mut frame = vec![0u8; 24];
    frame[..2].copy_from_slice(b"\xa5\x10");
    frame[3] = counter;
    frame[10] = counter.wrapping_mul(3);
    seal_checksum(&mut frame, VECTOR.checksum_seed).expect("fixture checksum");
    frame
}

fn system() -> Vec<u8> {
    let mut frame = vec![0x20u8; 28];
    frame[..2].copy_from_slice(b"\xa5\x11");
    seal_checksum(&mut frame, VECTOR.checksum_seed).expect("fixture checksum");
    frame
}

/// `frames` velocity records with a system record and noise every tenth record.
fn make_stream(frames: usize) -> Vec<u8> {
    let mut stream = Vec::new();
    for i in 0..frames {
        stream.extend(velocity(i as u8));
        if i % 10 == 9 {
            stream.extend(system());
            stream.extend_from_slice(b"\x00\x13\x37\xa5");
        }
    }
    stream
}

fn bench_scan(c: &mut Criterion) {
    let sieve = Sieve::new(VECTOR.frame_specs(), VECTOR.checksum_seed);
    let mut group = c.benchmark_group("sieve_scan");
    for frames in [1usize, 16, 128] {
        let stream = make_stream(frames);
        group.bench_with_input(BenchmarkId::new("frames", frames), &stream, |b, stream| {
            b.iter(|| sieve.scan(black_box(stream), &mut VecDeque::new()))
        });
    }
    group.finish();
}

/// Byte-at-a-time delivery, the worst case for re-scanning.
fn bench_trickle(c: &mut Criterion) {
    let stream = make_stream(16);
    c.bench_function("stream_chunker_trickle", |b| {
        b.iter(|| {
            let mut chunker =
                StreamChunker::new(Sieve::new(VECTOR.frame_specs(), VECTOR.checksum_seed), 4096);
            let mut delivered = 0;
            for byte in &stream {
                delivered += chunker.push(black_box(std::slice::from_ref(byte))).len();
            }
            delivered
        })
    });
}

criterion_group!(benches, bench_scan, bench_trickle);
criterion_main!(benches);
