//! Event store tests against an on-disk database.

use feedsync::{
    BackgroundWorker, BatchOutcome, Event, EventStore, Filter, StoreConfig, Tag, Timestamp,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn test_store(dir: &TempDir) -> Arc<EventStore> {
    Arc::new(
        EventStore::open(StoreConfig {
            path: dir.path().join("db").join("events.db"),
            event_cache_size: 100,
            create_if_missing: true,
        })
        .unwrap(),
    )
}

fn worker() -> BackgroundWorker {
    BackgroundWorker::spawn("store-test", Duration::from_millis(10)).unwrap()
}

fn event(id: &str, author: &str, kind: u32, created_at: u64, tags: &[&[&str]]) -> Event {
    Event {
        id: id.to_string(),
        author: author.to_string(),
        created_at: Timestamp(created_at),
        kind,
        tags: tags.iter().map(|t| Tag::new(t.iter().copied())).collect(),
        content: format!("note {id}"),
        signature: format!("sig-{id}"),
    }
}

fn store_all(worker: &BackgroundWorker, store: &Arc<EventStore>, events: Vec<Event>) -> BatchOutcome {
    let store = store.clone();
    worker
        .run_blocking(move |bg| store.insert_batch(bg, &events))
        .unwrap()
}

fn ids(events: &[Event]) -> Vec<&str> {
    events.iter().map(|e| e.id.as_str()).collect()
}

// --- Idempotence ---

#[test]
fn test_same_event_from_many_relays_is_stored_once() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let worker = worker();
    let e = event("a", "alice", 1, 10, &[&["p", "bob"], &["t", "rust"]]);

    let outcome = store_all(&worker, &store, vec![e.clone(), e.clone(), e.clone()]);

    assert_eq!(outcome.inserted, 1);
    assert_eq!(outcome.duplicates, 2);
    assert!(outcome.failed.is_empty());
    assert_eq!(store.count_all().unwrap(), 1);
    assert_eq!(store.count_by_tag("p", "bob").unwrap(), 1);
    assert_eq!(store.get_by_id("a").unwrap(), Some(e));
}

#[test]
fn test_events_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let long_tag: &[&str] = &["p", "bob", "wss://relay", "mention", "extra", "more"];
    let e = event("a", "alice", 1, 10, &[long_tag, &["e"], &[]]);

    {
        let store = test_store(&dir);
        store_all(&worker(), &store, vec![e.clone()]);
    }

    let store = test_store(&dir);
    let loaded = store.get_by_id("a").unwrap().unwrap();
    assert_eq!(loaded, e);
    assert_eq!(loaded.tags[0].len(), 6);
    assert!(loaded.tags[2].is_empty());
}

// --- Lookups ---

#[test]
fn test_get_by_tag_matches_name_and_value_only() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    store_all(
        &worker(),
        &store,
        vec![
            event("reply", "bob", 1, 30, &[&["e", "root"], &["p", "abc"]]),
            event("other-p", "bob", 1, 20, &[&["p", "xyz"], &["e", "abc"]]),
            event("long", "carol", 7, 40, &[&["p", "abc", "wss://r", "mention", "x"]]),
            event("value-in-slot2", "dave", 1, 50, &[&["t", "p", "abc"]]),
            event("bare", "erin", 1, 60, &[&["p"]]),
        ],
    );

    let found = store.get_by_tag("p", "abc").unwrap();
    assert_eq!(ids(&found), vec!["long", "reply"]);
    assert_eq!(store.count_by_tag("p", "abc").unwrap(), 2);
    assert!(store.get_by_tag("p", "nobody").unwrap().is_empty());
}

#[test]
fn test_get_by_ids_skips_missing() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    store_all(
        &worker(),
        &store,
        vec![event("a", "alice", 1, 1, &[]), event("b", "alice", 1, 2, &[])],
    );

    let wanted = vec!["a".to_string(), "missing".to_string(), "b".to_string()];
    assert_eq!(ids(&store.get_by_ids(&wanted).unwrap()), vec!["b", "a"]);
    assert_eq!(store.count_by_ids(&wanted).unwrap(), 2);
    assert!(store.get_by_ids(&[]).unwrap().is_empty());
}

#[test]
fn test_large_id_lists_are_chunked() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let events: Vec<Event> = (0..1200)
        .map(|i| event(&format!("id{i:04}"), "alice", 1, i, &[]))
        .collect();
    store_all(&worker(), &store, events);

    let wanted: Vec<String> = (0..1200).map(|i| format!("id{i:04}")).collect();
    let found = store.get_by_ids(&wanted).unwrap();
    assert_eq!(found.len(), 1200);
    assert_eq!(found[0].id, "id1199");
}

// --- Filter queries ---

#[test]
fn test_query_with_filters() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    store_all(
        &worker(),
        &store,
        vec![
            event("n1", "alice", 1, 10, &[&["t", "rust"]]),
            event("n2", "alice", 1, 20, &[]),
            event("n3", "alice", 1, 30, &[&["t", "rust"]]),
            event("r1", "bob", 7, 25, &[&["e", "n1"]]),
            event("m1", "bob", 0, 5, &[]),
        ],
    );

    let recent = Filter::new()
        .authors(["alice"])
        .kinds([1])
        .since(Timestamp(15))
        .limit(1);
    assert_eq!(ids(&store.query(&[recent]).unwrap()), vec!["n3"]);

    let tagged = Filter::new().tag('t', ["rust"]);
    assert_eq!(ids(&store.query(&[tagged.clone()]).unwrap()), vec!["n3", "n1"]);

    let reactions = Filter::new().kinds([7]).tag('e', ["n1"]);
    let both = store.query(&[tagged, reactions]).unwrap();
    assert_eq!(ids(&both), vec!["n3", "r1", "n1"]);

    let search = Filter::new().search("NOTE N2");
    assert_eq!(ids(&store.query(&[search]).unwrap()), vec!["n2"]);

    assert_eq!(store.count(&[Filter::new().until(Timestamp(20))]).unwrap(), 3);
    assert_eq!(store.count(&[]).unwrap(), 0);
}

#[test]
fn test_query_agrees_with_in_memory_match() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let events: Vec<Event> = (0..40)
        .map(|i| {
            let author = ["alice", "bob", "carol"][i % 3];
            let p = format!("{}", i % 4);
            event(&format!("e{i}"), author, (i % 2) as u32, i as u64, &[&["p", p.as_str()]])
        })
        .collect();
    store_all(&worker(), &store, events.clone());

    let filters = [
        Filter::new().authors(["bob"]).kinds([1]),
        Filter::new().tag('p', ["2", "3"]).since(Timestamp(10)),
        Filter::new().ids(["e1", "e2", "nope"]),
    ];
    for filter in &filters {
        let expected: BTreeSet<&str> = events
            .iter()
            .filter(|e| filter.matches(e))
            .map(|e| e.id.as_str())
            .collect();
        let stored = store.query(std::slice::from_ref(filter)).unwrap();
        let got: BTreeSet<&str> = stored.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(got, expected, "filter {filter:?}");
    }
}

// --- Deletion ---

#[test]
fn test_delete_by_ids_cascades() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let worker = worker();
    store_all(
        &worker,
        &store,
        vec![
            event("a", "alice", 1, 1, &[&["p", "bob"]]),
            event("b", "alice", 1, 2, &[&["p", "bob"]]),
        ],
    );

    let deleting = store.clone();
    let removed = worker
        .run_blocking(move |bg| deleting.delete_by_ids(bg, &["a".to_string(), "zzz".to_string()]))
        .unwrap()
        .unwrap();

    assert_eq!(removed, 1);
    assert_eq!(ids(&store.get_by_tag("p", "bob").unwrap()), vec!["b"]);
    assert_eq!(store.count_by_author("alice").unwrap(), 1);
}
