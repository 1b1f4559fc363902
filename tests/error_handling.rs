//! Error handling and edge case tests.

use feedsync::subscriptions::link::deliver;
use feedsync::{
    ChannelId, ConnectionState, DesiredFilters, DispatchHooks, Event, EventStore, FilterSet,
    RelayError, RelayLink, RelayListener, RelayMessage, StoreConfig, SyncConfig, SyncError,
    SyncSession, WatermarkTable,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Relay pool double that never has anything live.
struct NullLink;

impl RelayLink for NullLink {
    fn send(&self, _id: &ChannelId, _filters: &FilterSet) {}

    fn close(&self, _id: &ChannelId) {}

    fn is_live(&self, _id: &ChannelId) -> bool {
        false
    }
}

/// Route crate logs through the test harness's captured output.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn login_with_hooks(hooks: DispatchHooks, config: SyncConfig) -> SyncSession {
    init_tracing();
    SyncSession::login(
        "alice",
        Arc::new(EventStore::in_memory(10).unwrap()),
        Arc::new(WatermarkTable::new()),
        Arc::new(NullLink),
        config,
        hooks,
    )
    .unwrap()
}

// --- Wire boundary ---

#[test]
fn test_non_string_tag_element_rejected() {
    let frame = r#"["EVENT","home-1",{"id":"x","pubkey":"p","created_at":1,"kind":1,"tags":[["p",7]],"content":"","sig":"s"}]"#;
    assert!(matches!(
        RelayMessage::parse(frame),
        Err(SyncError::MalformedMessage(_))
    ));
}

#[test]
fn test_unknown_frame_rejected() {
    assert!(matches!(
        RelayMessage::parse(r#"["HELLO","x"]"#),
        Err(SyncError::MalformedMessage(_))
    ));
    assert!(matches!(
        RelayMessage::parse(r#"{"EVENT":1}"#),
        Err(SyncError::MalformedMessage(_))
    ));
    assert!(matches!(
        RelayMessage::parse(r#"["OK","id","yes"]"#),
        Err(SyncError::MalformedMessage(_))
    ));
}

#[test]
fn test_malformed_frame_reported_to_error_hook() {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    let session = login_with_hooks(
        DispatchHooks {
            on_error: Some(Box::new(move |relay: &str, error: &RelayError| {
                sink.lock().push((relay.to_string(), error.clone()))
            })),
            ..Default::default()
        },
        SyncConfig::default(),
    );
    let listener = session.listener();

    assert!(deliver(&*listener, "wss://bad", "[\"EVENT\"").is_err());
    deliver(&*listener, "wss://bad", r#"["CLOSED","home-3","rate-limited"]"#).unwrap();

    let errors = errors.lock();
    assert_eq!(errors.len(), 2);
    assert!(matches!(errors[0].1, RelayError::Protocol(_)));
    assert_eq!(
        errors[1].1,
        RelayError::Closed {
            subscription_id: "home-3".to_string(),
            message: "rate-limited".to_string(),
        }
    );
}

// --- Relay failures ---

#[test]
fn test_relay_errors_do_not_disturb_other_relays() {
    let session = login_with_hooks(DispatchHooks::default(), SyncConfig::default());
    let listener = session.listener();

    listener.on_connection_state("wss://up", ConnectionState::Connected);
    listener.on_connection_state("wss://down", ConnectionState::Connecting);
    listener.on_error("wss://down", RelayError::Connect("refused".into()));
    listener.on_connection_state("wss://down", ConnectionState::Disconnected);

    let dispatcher = session.dispatcher();
    assert_eq!(dispatcher.relay_state("wss://up"), Some(ConnectionState::Connected));
    assert_eq!(
        dispatcher.relay_state("wss://down"),
        Some(ConnectionState::Disconnected)
    );
}

#[test]
fn test_forged_event_id_dropped_when_verifying() {
    let session = login_with_hooks(
        DispatchHooks::default(),
        SyncConfig {
            verify_event_ids: true,
            ..Default::default()
        },
    );
    let feed = session.coordinator("home", |_ids: &[ChannelId]| DesiredFilters::new());
    let channel = feed.request_new_channel(None);

    let mut genuine = Event {
        id: String::new(),
        author: "alice".to_string(),
        created_at: feedsync::Timestamp(1_700_000_000),
        kind: 1,
        tags: vec![feedsync::Tag::new(["t", "test"])],
        content: "hello".to_string(),
        signature: "sig".to_string(),
    };
    genuine.id = genuine.compute_id().unwrap();
    let mut forged = genuine.clone();
    forged.content = "tampered".to_string();

    let listener = session.listener();
    listener.on_event(genuine.clone(), channel.id().as_str(), "wss://r");
    listener.on_event(forged, channel.id().as_str(), "wss://r");
    session.flush().unwrap();

    assert_eq!(session.store().count_all().unwrap(), 1);
    assert_eq!(
        session.store().get_by_id(&genuine.id).unwrap().unwrap().content,
        "hello"
    );
}

// --- Lifecycle ---

#[test]
fn test_open_missing_store_without_create() {
    let dir = TempDir::new().unwrap();
    let result = EventStore::open(StoreConfig {
        path: dir.path().join("missing.db"),
        event_cache_size: 10,
        create_if_missing: false,
    });
    assert!(matches!(result, Err(SyncError::NotInitialized(_))));
}

#[test]
fn test_coordinator_after_logout_reports_stopped_worker() {
    let session = login_with_hooks(DispatchHooks::default(), SyncConfig {
        debounce: Duration::from_millis(5),
        ..Default::default()
    });
    let feed = session.coordinator("home", |_ids: &[ChannelId]| DesiredFilters::new());
    session.logout().unwrap();

    assert!(matches!(feed.reset_filters(), Err(SyncError::WorkerStopped)));
    assert!(matches!(feed.invalidate_filters(), Err(SyncError::WorkerStopped)));
}

#[test]
fn test_events_after_logout_are_ignored() {
    let session = login_with_hooks(DispatchHooks::default(), SyncConfig::default());
    let listener = session.listener();
    let store = session.store().clone();
    session.logout().unwrap();

    let event = Event {
        id: "late".to_string(),
        author: "bob".to_string(),
        created_at: feedsync::Timestamp(1),
        kind: 1,
        tags: vec![],
        content: String::new(),
        signature: "s".to_string(),
    };
    listener.on_event(event, "home-1", "wss://r");
    listener.on_eose("home-1", "wss://r");

    assert_eq!(store.count_all().unwrap(), 0);
}
