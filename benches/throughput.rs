//! Criterion benches over the enclave runtime.
//!
//! Deliberately small: population throughput with all enclaves inserting
//! concurrently. Run with `cargo bench --bench throughput`.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use hosk::{BenchConfig, Coordinator, Topology};

fn populate_throughput(c: &mut Criterion) {
    const KEYS: u64 = 10_000;

    let mut group = c.benchmark_group("populate");
    group.sample_size(10);
    group.throughput(Throughput::Elements(KEYS));

    for threads in [1usize, 2, 4] {
        group.bench_with_input(
            BenchmarkId::from_parameter(threads),
            &threads,
            |b, &threads| {
                b.iter(|| {
                    let cfg = BenchConfig {
                        duration_ms: 1,
                        initial: KEYS,
                        threads,
                        range: KEYS * 8,
                        seed: 1,
                        update: 0,
                        ..Default::default()
                    };
                    let topo = Topology::uniform(threads);
                    let mut coord = Coordinator::new(cfg, &topo, false).expect("setup");
                    let size = coord.populate().expect("populate");
                    assert_eq!(size, KEYS);
                    coord
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, populate_throughput);
criterion_main!(benches);
