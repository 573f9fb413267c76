//! Benchmarks for tracking store operations

use chrono::{Duration, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use filerelay::storage::queries::*;
use filerelay::storage::TrackingStore;
use filerelay::types::*;

fn path(i: usize) -> RelativePath {
    RelativePath::new(format!("exports/{:03}/file{:06}.csv", i % 100, i)).unwrap()
}

/// Store with `n` records, every third one forwarded
fn populated(n: usize) -> TrackingStore {
    let store = TrackingStore::open_in_memory().unwrap();
    let start = Utc::now() - Duration::days(30);
    store
        .with_transaction(|conn| {
            for i in 0..n {
                let at = start + Duration::seconds(i as i64);
                insert_download(conn, &path(i), at)?;
                if i % 3 == 0 {
                    set_forwarded(conn, &path(i), at)?;
                }
            }
            Ok(())
        })
        .unwrap();
    store
}

fn bench_record_download(c: &mut Criterion) {
    let store = TrackingStore::open_in_memory().unwrap();

    let mut group = c.benchmark_group("record_download");
    group.throughput(Throughput::Elements(1));

    group.bench_function("new_path", |b| {
        let mut i = 0;
        b.iter(|| {
            i += 1;
            store.record_download(black_box(&path(i))).unwrap()
        })
    });

    // Already tracked: must be a no-op
    group.bench_function("known_path", |b| {
        let known = path(0);
        b.iter(|| store.record_download(black_box(&known)).unwrap())
    });

    group.finish();
}

fn bench_listing(c: &mut Criterion) {
    let mut group = c.benchmark_group("listing");

    for size in [100, 1_000, 10_000] {
        let store = populated(size);
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::new("all_paths", size), &size, |b, _| {
            b.iter(|| store.all_paths().unwrap())
        });
        group.bench_with_input(BenchmarkId::new("not_forwarded", size), &size, |b, _| {
            b.iter(|| store.not_forwarded().unwrap())
        });
        group.bench_with_input(BenchmarkId::new("older_than", size), &size, |b, _| {
            let cutoff = Utc::now() - Duration::days(29);
            b.iter(|| store.older_than(black_box(cutoff)).unwrap())
        });
    }

    group.finish();
}

fn bench_stats(c: &mut Criterion) {
    let store = populated(10_000);
    c.bench_function("stats_10k", |b| b.iter(|| store.stats().unwrap()));
}

criterion_group!(benches, bench_record_download, bench_listing, bench_stats);
criterion_main!(benches);
