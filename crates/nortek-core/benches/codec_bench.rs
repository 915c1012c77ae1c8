//! Criterion benchmarks for the Nortek field codecs and configuration block.
//!
//! A Vector in burst mode emits a velocity record every 15 ms, and every
//! record is checksummed; the user block is decoded on every `GC` read.
//!
//! Run with:
//! ```bash
//! cargo bench --package nortek-core --bench codec_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use nortek_core::params::user_config::nortek_registry;
use nortek_core::protocol::codec::{bytes_to_bitfield, checksum, seal_checksum, words_to_datetime};
use nortek_core::protocol::frames::{
    decode_frame, HARDWARE_CONFIG, HW_CONFIG_LEN, HW_CONFIG_SYNC, USER_CONFIG_LEN, USER_CONFIG_SYNC,
};
use nortek_core::VECTOR;

// ── Fixtures ──────────────────────────────────────────────────────────────────

fn make_block(len: usize, sync: &[u8]) -> Vec<u8> {
    let mut block: Vec<u8> = (0..len).map(|i| (i % 10) as u8).collect();
    block[..sync.len()].copy_from_slice(sync);
    seal_checksum(&mut block, VECTOR.checksum_seed).expect("fixture checksum");
    block
}

// ── Benchmark groups ──────────────────────────────────────────────────────────

/// Checksum over each frame length the instrument produces.
fn bench_checksum(c: &mut Criterion) {
    let mut group = c.benchmark_group("checksum");
    for len in [24usize, 28, 42, 48, 224, 512] {
        let block = make_block(len, b"\xa5\x10");
        group.bench_with_input(BenchmarkId::new("len", len), &block, |b, block| {
            b.iter(|| checksum(black_box(block), block.len(), VECTOR.checksum_seed).unwrap())
        });
    }
    group.finish();
}

fn bench_field_codecs(c: &mut Criterion) {
    let mut group = c.benchmark_group("field_codecs");
    group.bench_function("bitfield", |b| {
        b.iter(|| bytes_to_bitfield(black_box(&[0x37, 0x01])))
    });
    group.bench_function("bcd_datetime", |b| {
        b.iter(|| words_to_datetime(black_box(&[0x29, 0x11, 0x17, 0x14, 0x13, 0x06])).unwrap())
    });
    group.finish();
}

/// Hardware config decode and a full user block decode + rebuild.
fn bench_blocks(c: &mut Criterion) {
    let mut group = c.benchmark_group("config_blocks");

    let hardware = make_block(HW_CONFIG_LEN, HW_CONFIG_SYNC);
    group.bench_function("decode_hardware", |b| {
        b.iter(|| decode_frame(&HARDWARE_CONFIG, black_box(&hardware), VECTOR.checksum_seed).unwrap())
    });

    let user = make_block(USER_CONFIG_LEN, USER_CONFIG_SYNC);
    let mut registry = nortek_registry(&VECTOR).expect("registry");
    group.bench_function("update_from_user_block", |b| {
        b.iter(|| registry.update_from_block(black_box(&user)).unwrap())
    });
    group.bench_function("build_user_block", |b| {
        b.iter(|| registry.build_configuration_block().unwrap())
    });

    group.finish();
}

criterion_group!(benches, bench_checksum, bench_field_codecs, bench_blocks);
criterion_main!(benches);
