//! Performance benchmarks for reconciliation

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mirror_sync::storage::Storage;
use mirror_sync::sync::{plan_dependency_order, MemoryRemote, ReconciliationEngine, SqliteMirror, PASS_SLACK};
use mirror_sync::types::*;

/// A category tree listed leaves first, `fanout` children per node
fn category_tree(size: usize, fanout: usize) -> Vec<RemoteItem> {
    let mut items: Vec<RemoteItem> = (1..=size as ItemId)
        .map(|id| {
            let parent = if id == 1 {
                None
            } else {
                Some((id - 2) / fanout as ItemId + 1)
            };
            RemoteItem::new(id, parent).with_field("name", format!("category-{}", id))
        })
        .collect();
    items.reverse();
    items
}

fn bench_dependency_order(c: &mut Criterion) {
    let mut group = c.benchmark_group("dependency_order");

    for size in [100, 1000, 5000] {
        let items = category_tree(size, 8);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &items, |b, items| {
            b.iter(|| plan_dependency_order(black_box(items), items.len() + PASS_SLACK).ordered.len())
        });
    }

    group.finish();
}

fn bench_reconcile(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("reconcile");
    group.sample_size(20);

    for size in [100, 1000] {
        let remote = MemoryRemote::new();
        remote.set_collection("categories", category_tree(size, 8));
        let spec = ResourceSpec::hierarchical("categories");
        let mirror = SqliteMirror::new("categories");
        group.throughput(Throughput::Elements(size as u64));

        // First pass inserts everything
        group.bench_function(BenchmarkId::new("initial", size), |b| {
            b.iter(|| {
                let storage = Storage::open_in_memory().unwrap();
                let engine = ReconciliationEngine::new(storage, SyncConfig::default());
                rt.block_on(engine.reconcile(&spec, &remote, &mirror, &QueryParams::default()))
                    .unwrap()
            })
        });

        // Repeated pass over an unchanged catalog
        let storage = Storage::open_in_memory().unwrap();
        let engine = ReconciliationEngine::new(storage, SyncConfig::default());
        rt.block_on(engine.reconcile(&spec, &remote, &mirror, &QueryParams::default()))
            .unwrap();
        group.bench_function(BenchmarkId::new("unchanged", size), |b| {
            b.iter(|| {
                rt.block_on(engine.reconcile(&spec, &remote, &mirror, &QueryParams::default()))
                    .unwrap()
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_dependency_order, bench_reconcile);
criterion_main!(benches);
