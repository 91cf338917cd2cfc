//! Criterion benchmarks for KIII stepping.
//!
//! Run with:
//!   cargo bench
//!   cargo bench --no-default-features --features serde
//!
//! Results are saved to target/criterion/

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use ksets::prelude::*;

fn make_network(input_size: usize) -> Network {
    let mut net = Network::new(KsetConfig::with_input_size(input_size).with_seed(42))
        .expect("valid benchmark config");
    net.initialize().expect("warm-up");
    net
}

/// One tick per iteration, sequential vs one task per layer.
fn bench_tick_modes(c: &mut Criterion) {
    let mut group = c.benchmark_group("tick");

    for size in [8, 64, 256].iter() {
        group.throughput(Throughput::Elements(*size as u64 * 3));
        let stimulus = vec![0.5; *size];

        group.bench_with_input(BenchmarkId::new("sequential", size), size, |b, &size| {
            let mut net = make_network(size);
            b.iter(|| {
                net.step(&stimulus, 1).expect("tick");
                black_box(net.full_output()[0])
            });
        });

        group.bench_with_input(BenchmarkId::new("parallel", size), size, |b, &size| {
            let mut net = make_network(size);
            b.iter(|| {
                net.step_parallel(&stimulus, 1).expect("tick");
                black_box(net.full_output()[0])
            });
        });
    }

    group.finish();
}

/// A full presentation cycle (active + rest) of one pattern.
fn bench_pattern_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("pattern_cycle");
    group.sample_size(20);

    let size = 16;
    let pattern = vec![(0..size).map(|i| (i % 2) as f64).collect::<Vec<f64>>()];

    group.bench_function("run_16", |b| {
        let mut net = make_network(size);
        b.iter(|| black_box(net.run(&pattern).expect("run")));
    });

    group.bench_function("train_16", |b| {
        let mut net = make_network(size);
        b.iter(|| net.train(&pattern).expect("train"));
    });

    group.finish();
}

fn bench_serialization(c: &mut Criterion) {
    let mut group = c.benchmark_group("serialization");

    for size in [8, 64].iter() {
        let net = make_network(*size);
        let bytes = net.save_image_bytes().expect("save");
        group.throughput(Throughput::Bytes(bytes.len() as u64));

        group.bench_with_input(BenchmarkId::new("save", size), &net, |b, net| {
            b.iter(|| black_box(net.save_image_bytes().expect("save")));
        });
        group.bench_with_input(BenchmarkId::new("load", size), &bytes, |b, bytes| {
            b.iter(|| black_box(Network::load_image_bytes(bytes).expect("load")));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_tick_modes,
    bench_pattern_cycle,
    bench_serialization
);
criterion_main!(benches);
