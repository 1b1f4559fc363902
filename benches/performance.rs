//! Performance benchmarks for the event store and the reconciler.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use feedsync::{
    BackgroundWorker, ChannelId, ChannelRegistry, DesiredFilters, Event, EventStore, FeedType,
    Filter, FilterSet, RelayLink, StoreConfig, SubscriptionCoordinator, Tag, Timestamp,
    TypedFilter,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn create_store(dir: &TempDir) -> Arc<EventStore> {
    Arc::new(
        EventStore::open(StoreConfig {
            path: dir.path().join("events.db"),
            event_cache_size: 1000,
            create_if_missing: true,
        })
        .unwrap(),
    )
}

fn worker() -> BackgroundWorker {
    BackgroundWorker::spawn("bench", Duration::from_millis(10)).unwrap()
}

fn note(i: u64, tag_count: usize) -> Event {
    Event {
        id: format!("{i:064x}"),
        author: format!("author{}", i % 100),
        created_at: Timestamp(1_700_000_000 + i),
        kind: 1,
        tags: (0..tag_count)
            .map(|t| Tag::new(["p".to_string(), format!("author{}", (i as usize + t) % 100)]))
            .collect(),
        content: format!("note {i}"),
        signature: "sig".to_string(),
    }
}

/// Benchmark batch ingestion, including duplicate detection
fn bench_insert_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_batch");

    for tag_count in [0, 4, 16] {
        group.bench_with_input(
            BenchmarkId::new("tags_per_event", tag_count),
            &tag_count,
            |b, &tags| {
                let dir = TempDir::new().unwrap();
                let store = create_store(&dir);
                let worker = worker();
                let next = AtomicU64::new(0);

                b.iter(|| {
                    let start = next.fetch_add(100, Ordering::Relaxed);
                    let events: Vec<Event> = (start..start + 100).map(|i| note(i, tags)).collect();
                    let store = store.clone();
                    black_box(
                        worker
                            .run_blocking(move |bg| store.insert_batch(bg, &events))
                            .unwrap(),
                    );
                });
            },
        );
    }

    group.finish();
}

/// Benchmark tag and author lookups over a populated store
fn bench_lookups(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookups");

    for size in [1_000u64, 10_000] {
        let dir = TempDir::new().unwrap();
        let store = create_store(&dir);
        let writer = store.clone();
        worker()
            .run_blocking(move |bg| {
                let events: Vec<Event> = (0..size).map(|i| note(i, 3)).collect();
                writer.insert_batch(bg, &events)
            })
            .unwrap();

        group.bench_with_input(BenchmarkId::new("get_by_tag", size), &size, |b, _| {
            b.iter(|| black_box(store.get_by_tag("p", "author42").unwrap()));
        });
        group.bench_with_input(BenchmarkId::new("count_by_author_kind", size), &size, |b, _| {
            b.iter(|| black_box(store.count_by_author_kind("author7", 1).unwrap()));
        });
        group.bench_with_input(BenchmarkId::new("filter_query", size), &size, |b, _| {
            let filter = Filter::new().kinds([1]).tag('p', ["author3"]).limit(50);
            b.iter(|| black_box(store.query(std::slice::from_ref(&filter)).unwrap()));
        });
    }

    group.finish();
}

struct NoopLink;

impl RelayLink for NoopLink {
    fn send(&self, id: &ChannelId, filters: &FilterSet) {
        black_box((id, filters));
    }

    fn close(&self, id: &ChannelId) {
        black_box(id);
    }

    fn is_live(&self, _id: &ChannelId) -> bool {
        true
    }
}

/// Benchmark a no-change reconciliation pass
fn bench_reconcile(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconcile_unchanged");

    for channels in [10usize, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("channels", channels), &channels, |b, &n| {
            let feed = SubscriptionCoordinator::new(
                "bench",
                Arc::new(NoopLink),
                Arc::new(ChannelRegistry::new()),
                Arc::new(worker()),
                |ids: &[ChannelId]| {
                    ids.iter()
                        .map(|id| {
                            let filters = FilterSet::new(vec![TypedFilter::new(
                                [FeedType::Follows],
                                Filter::new().kinds([1, 6, 7]).authors(["a", "b", "c"]),
                            )]);
                            (id.clone(), Some(filters))
                        })
                        .collect::<DesiredFilters>()
                },
            );
            for _ in 0..n {
                feed.request_new_channel(None);
            }
            feed.start().unwrap();

            b.iter(|| feed.reset_filters().unwrap());
        });
    }

    group.finish();
}

criterion_group!(benches, bench_insert_batch, bench_lookups, bench_reconcile);

criterion_main!(benches);
