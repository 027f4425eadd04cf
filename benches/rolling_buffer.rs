//! Criterion benchmarks for the scan loop hot paths.
//!
//! Every control tick reads and writes one tick of samples through the rolling
//! buffers and encodes finished chunks, so these set the baseline for how short a
//! tick can get.
//!
//! Run with: cargo bench --bench rolling_buffer

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dslm_daq::data::chunk::encode_chunk;
use dslm_daq::data::rolling_buffer::{FillingRollingBuffer, RollingBuffer};
use ndarray::Array4;

/// One tick of reads at an offset that wraps around the end of the period.
fn rolling_buffer_read_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("rolling_buffer_read");

    for (name, period, tick) in [
        ("short_period", 2_000, 10_000),
        ("volume_period", 40_000, 10_000),
        ("long_period", 400_000, 10_000),
    ] {
        let buffer = RollingBuffer::new(period);
        let start = period - tick / 2;

        group.throughput(Throughput::Elements(tick as u64));
        group.bench_with_input(BenchmarkId::new("read", name), &tick, |b, &tick| {
            b.iter(|| black_box(buffer.read(black_box(start), tick)));
        });
    }

    group.finish();
}

/// Writing recorded piezo samples into the filling buffer.
fn filling_buffer_write_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("filling_buffer_write");
    let tick = vec![1.5f64; 10_000];

    for period in [20_000usize, 40_000, 400_000] {
        let mut buffer = FillingRollingBuffer::new(period);
        let mut start = 0;

        group.throughput(Throughput::Elements(tick.len() as u64));
        group.bench_with_input(BenchmarkId::new("write", period), &period, |b, &period| {
            b.iter(|| {
                buffer.write(black_box(&tick), start);
                start = (start + tick.len()) % period;
            });
        });
    }

    group.finish();
}

/// Chunk encoding for a few volume sizes.
fn chunk_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_encode");
    group.sample_size(10);

    for (name, shape) in [
        ("4x20x256x256", (4, 20, 256, 256)),
        ("2x40x512x512", (2, 40, 512, 512)),
    ] {
        let data = Array4::from_shape_fn(shape, |(v, p, y, x)| ((v + p * 7 + y * 3 + x) % 1000) as u16);

        group.throughput(Throughput::Bytes((data.len() * 2) as u64));
        group.bench_with_input(BenchmarkId::new("encode", name), &data, |b, data| {
            b.iter(|| black_box(encode_chunk(data.view())));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    rolling_buffer_read_tick,
    filling_buffer_write_tick,
    chunk_encode
);
criterion_main!(benches);
