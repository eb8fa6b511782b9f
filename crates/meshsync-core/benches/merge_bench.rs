//! Benchmarks for document merge and snapshot paths
//!
//! Run with: cargo bench -p meshsync-core
//!
//! Baselines for:
//! - Local writes
//! - Merging a peer's backlog
//! - Delta computation for a peer
//! - Snapshot export/import

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use meshsync_core::document::{Audience, Change, DocumentStore, Listing, Model, Schema};
use meshsync_core::{ReplicaId, VersionVector};

fn store(name: &str) -> DocumentStore {
    DocumentStore::new_in_memory(ReplicaId::new(name), Schema::community()).unwrap()
}

fn populated(name: &str, listings: usize) -> DocumentStore {
    let store = store(name);
    for i in 0..listings {
        let id = store
            .insert(&Listing {
                title: format!("Item {}", i),
                category: "tools".into(),
                available: true,
                ..Default::default()
            })
            .unwrap();
        if i % 3 == 0 {
            store
                .apply_local_change(|tx| tx.append(Listing::COLLECTION, &id, "comments", "taken?"))
                .unwrap();
        }
    }
    store
}

fn backlog(store: &DocumentStore) -> Vec<Change> {
    store
        .changes_since(&VersionVector::new(), Audience::Community)
        .unwrap()
}

fn bench_local_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("local_insert");
    for size in [0usize, 100, 1000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || populated("local", size),
                |store| {
                    black_box(
                        store
                            .insert(&Listing {
                                title: "New".into(),
                                category: "tools".into(),
                                ..Default::default()
                            })
                            .unwrap(),
                    )
                },
                criterion::BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

fn bench_merge_remote(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_remote");
    for size in [10usize, 100, 1000] {
        let changes = backlog(&populated("peer", size));
        group.throughput(Throughput::Elements(changes.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &changes, |b, changes| {
            b.iter_batched(
                || (store("local"), changes.clone()),
                |(store, changes)| black_box(store.merge_remote(changes).unwrap()),
                criterion::BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

fn bench_duplicate_merge(c: &mut Criterion) {
    let source = populated("peer", 500);
    let changes = backlog(&source);
    let target = store("local");
    target.merge_remote(changes.clone()).unwrap();

    c.bench_function("merge_remote_duplicates_500", |b| {
        b.iter(|| black_box(target.merge_remote(changes.clone()).unwrap()))
    });
}

fn bench_changes_since(c: &mut Criterion) {
    let mut group = c.benchmark_group("changes_since");
    let source = populated("peer", 1000);
    let half = store("half");
    let changes = backlog(&source);
    half.merge_remote(changes[..changes.len() / 2].to_vec()).unwrap();

    for (name, remote) in [("empty_peer", VersionVector::new()), ("half_peer", half.version())] {
        group.bench_function(name, |b| {
            b.iter(|| black_box(source.changes_since(&remote, Audience::Community)))
        });
    }
    group.finish();
}

fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot");
    let source = populated("peer", 1000);
    let bytes = source.export_snapshot_for(Audience::Community).unwrap();
    group.throughput(Throughput::Bytes(bytes.len() as u64));

    group.bench_function("export_1000", |b| {
        b.iter(|| black_box(source.export_snapshot_for(Audience::Community).unwrap()))
    });
    group.bench_function("import_1000", |b| {
        b.iter_batched(
            || store("fresh"),
            |store| store.import_snapshot(black_box(&bytes)).unwrap(),
            criterion::BatchSize::SmallInput,
        )
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_local_insert,
    bench_merge_remote,
    bench_duplicate_merge,
    bench_changes_since,
    bench_snapshot
);
criterion_main!(benches);
