//! 熵解码核心性能基准测试.
//!
//! 覆盖 CABAC 上下文 bin, 旁路 bin 与 Exp-Golomb 读取路径.

use avc_engine::core::{BitCache, BitWriter};
use avc_engine::decoder::{ArithmeticDecoder, CabacEncoder};
use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};

const BIN_COUNT: usize = 100_000;

/// 生成偏斜分布的伪随机 bin 序列
fn make_bins(len: usize) -> Vec<(usize, u32)> {
    let mut seed = 0x2545_f491u32;
    (0..len)
        .map(|i| {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            (11 + (i % 16) * 2, u32::from(seed % 6 == 0))
        })
        .collect()
}

fn encode_bins(bins: &[(usize, u32)]) -> Vec<u8> {
    let mut enc = CabacEncoder::new(BitWriter::new(), 1, 26);
    for &(ctx, bin) in bins {
        enc.encode_bin(ctx, bin);
    }
    enc.encode_terminate(1);
    enc.finish().finish()
}

fn bench_decode_bin(c: &mut Criterion) {
    let bins = make_bins(BIN_COUNT);
    let data = encode_bins(&bins);
    let mut group = c.benchmark_group("cabac");
    group.throughput(Throughput::Elements(BIN_COUNT as u64));
    group.bench_function("decode_bin_100k", |b| {
        b.iter(|| {
            let mut dec = ArithmeticDecoder::new(BitCache::new(black_box(&data)), 1, 26);
            let mut ones = 0u32;
            for &(ctx, _) in &bins {
                ones += dec.decode_bin(ctx);
            }
            black_box(ones);
        });
    });
    group.finish();
}

fn bench_decode_bypass(c: &mut Criterion) {
    let mut enc = CabacEncoder::new(BitWriter::new(), 0, 26);
    for i in 0..BIN_COUNT as u32 {
        enc.encode_bypass(i.count_ones() & 1);
    }
    enc.encode_terminate(1);
    let data = enc.finish().finish();

    c.bench_function("cabac_decode_bypass_100k", |b| {
        b.iter(|| {
            let mut dec = ArithmeticDecoder::new(BitCache::new(black_box(&data)), 0, 26);
            let mut acc = 0u32;
            for _ in 0..BIN_COUNT {
                acc = acc.wrapping_add(dec.decode_bypass());
            }
            black_box(acc);
        });
    });
}

fn bench_bitcache_ue(c: &mut Criterion) {
    let mut writer = BitWriter::new();
    for i in 0..BIN_COUNT as u32 {
        writer.write_ue(i % 300);
    }
    writer.write_trailing_bits();
    let data = writer.finish();

    c.bench_function("bitcache_read_ue_100k", |b| {
        b.iter(|| {
            let mut bits = BitCache::new(black_box(&data));
            let mut acc = 0u32;
            for _ in 0..BIN_COUNT {
                acc = acc.wrapping_add(bits.read_ue(u32::MAX));
            }
            black_box(acc);
        });
    });
}

criterion_group!(
    benches,
    bench_decode_bin,
    bench_decode_bypass,
    bench_bitcache_ue,
);
criterion_main!(benches);
