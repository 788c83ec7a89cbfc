//! Graph build and k-NN search benchmarks.
//!
//! Run with: cargo bench --bench knn

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::Rng;
use vesper_engine::HnswIndex;

fn random_vectors(count: usize, dim: usize) -> Vec<Vec<f32>> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| (0..dim).map(|_| rng.gen_range(0.0..1.0)).collect())
        .collect()
}

fn bench_bulk_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("bulk_build");
    group.sample_size(10);
    for size in [1_000usize, 10_000] {
        let vectors = random_vectors(size, 128);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |bencher, &size| {
            bencher.iter(|| {
                let index = HnswIndex::new(128, size, 16, 200).unwrap();
                for (id, v) in vectors.iter().enumerate() {
                    index.insert_bulk(v, id as u32).unwrap();
                }
                black_box(index);
            });
        });
    }
    group.finish();
}

fn bench_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("knn_search");
    for size in [10_000usize, 50_000] {
        let vectors = random_vectors(size, 128);
        let index = HnswIndex::new(128, size, 16, 200).unwrap();
        for (id, v) in vectors.iter().enumerate() {
            index.insert_bulk(v, id as u32).unwrap();
        }

        // Warm the caches so tail latency reflects the steady state.
        for v in vectors.iter().take(100) {
            black_box(index.search_knn(v, 10, 100));
        }

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |bencher, _| {
            let mut i = 0usize;
            bencher.iter(|| {
                i = (i + 1) % vectors.len();
                black_box(index.search_knn(&vectors[i], 10, 100));
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_bulk_build, bench_search);
criterion_main!(benches);
