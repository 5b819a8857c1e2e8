use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use quiver::index::flat;
use quiver::index::{HnswConfig, HnswIndex};
use quiver::query::CancelToken;
use quiver::vector::{DistanceMetric, VectorRecord};
use rand::Rng;

fn generate_records(count: usize, dim: usize) -> Vec<Arc<VectorRecord>> {
    let mut rng = rand::rng();
    (0..count)
        .map(|i| {
            let data: Vec<f32> = (0..dim).map(|_| rng.random::<f32>()).collect();
            Arc::new(VectorRecord::new(format!("doc_{i}"), data).with_seq(i as u64 + 1))
        })
        .collect()
}

fn bench_hnsw_construction(c: &mut Criterion) {
    let mut group = c.benchmark_group("HNSW Construction");
    group.sample_size(10);
    let dim = 128;
    let config = HnswConfig::default();

    for count in [1000, 5000] {
        let records = generate_records(count, dim);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &records, |b, records| {
            b.iter(|| HnswIndex::build(records, DistanceMetric::Cosine, &config).unwrap())
        });
    }
    group.finish();
}

fn bench_hnsw_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("HNSW Search");
    let dim = 128;
    let count = 10_000;
    let records = generate_records(count, dim);
    let index = HnswIndex::build(&records, DistanceMetric::Cosine, &HnswConfig::default()).unwrap();
    let queries = generate_records(100, dim);
    let cancel = CancelToken::new();
    let allow_all = |_: usize| true;

    for ef in [32, 64, 128] {
        group.bench_with_input(BenchmarkId::new("ef", ef), &ef, |b, &ef| {
            let mut next = 0;
            b.iter(|| {
                let query = &queries[next % queries.len()].embedding;
                next += 1;
                black_box(
                    index
                        .search(&records, query, 10, ef, &allow_all, &cancel)
                        .unwrap(),
                )
            })
        });
    }

    // Exact scan over the same data as the baseline.
    let allow_record = |_: usize, _: &VectorRecord| true;
    group.bench_function("flat_scan", |b| {
        let mut next = 0;
        b.iter(|| {
            let query = &queries[next % queries.len()].embedding;
            next += 1;
            black_box(
                flat::scan(&records, query, 10, DistanceMetric::Cosine, &allow_record, &cancel)
                    .unwrap(),
            )
        })
    });
    group.finish();
}

criterion_group!(benches, bench_hnsw_construction, bench_hnsw_search);
criterion_main!(benches);
