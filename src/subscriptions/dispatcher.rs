//! Shared inbound listener: routes relay callbacks into channels and the store.

use super::coordinator::SubscriptionCoordinator;
use super::link::{ConnectionState, RelayError, RelayListener};
use super::registry::ChannelRegistry;
use crate::store::EventStore;
use crate::types::{Event, KindClass, RelayUrl, Timestamp};
use crate::worker::{Background, BackgroundWorker};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Dispatcher tuning.
#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// Subtracted from "now" when stamping an EOSE.
    pub eose_clock_skew: Duration,
    /// Drop events whose id does not match their content hash.
    pub verify_event_ids: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            eose_clock_skew: Duration::from_secs(60),
            verify_event_ids: false,
        }
    }
}

type ErrorHook = Box<dyn Fn(&str, &RelayError) + Send + Sync>;
type TextHook = Box<dyn Fn(&str, &str) + Send + Sync>;
type SendResponseHook = Box<dyn Fn(&str, &str, bool, &str) + Send + Sync>;

/// Optional host callbacks. Unset hooks are skipped.
#[derive(Default)]
pub struct DispatchHooks {
    /// (relay, error)
    pub on_error: Option<ErrorHook>,
    /// (relay, challenge)
    pub on_auth: Option<TextHook>,
    /// (relay, message)
    pub on_notify: Option<TextHook>,
    /// (relay, event id, accepted, message)
    pub on_send_response: Option<SendResponseHook>,
}

/// Events seen for one (subscription, kind) pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventCount {
    pub subscription_id: String,
    pub kind: u32,
    pub count: u64,
}

/// The single listener shared by every relay of a session.
///
/// Callbacks only enqueue work; registry checks, store writes and EOSE
/// bookkeeping run on the background worker, in arrival order.
pub struct Dispatcher {
    registry: Arc<ChannelRegistry>,
    store: Arc<EventStore>,
    worker: Arc<BackgroundWorker>,
    config: DispatchConfig,
    hooks: DispatchHooks,
    counters: Mutex<BTreeMap<(String, u32), u64>>,
    relays: RwLock<HashMap<RelayUrl, ConnectionState>>,
    coordinators: RwLock<Vec<Weak<SubscriptionCoordinator>>>,
    this: Weak<Dispatcher>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        store: Arc<EventStore>,
        worker: Arc<BackgroundWorker>,
        config: DispatchConfig,
        hooks: DispatchHooks,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            registry,
            store,
            worker,
            config,
            hooks,
            counters: Mutex::new(BTreeMap::new()),
            relays: RwLock::new(HashMap::new()),
            coordinators: RwLock::new(Vec::new()),
            this: this.clone(),
        })
    }

    /// Invalidate `coordinator` whenever a relay (re)connects.
    pub fn attach(&self, coordinator: &Arc<SubscriptionCoordinator>) {
        let mut coordinators = self.coordinators.write();
        coordinators.retain(|c| c.strong_count() > 0);
        coordinators.push(Arc::downgrade(coordinator));
    }

    /// Last reported state of `relay`.
    pub fn relay_state(&self, relay: &str) -> Option<ConnectionState> {
        self.relays.read().get(relay).copied()
    }

    /// Per-(subscription, kind) counts of events accepted so far.
    pub fn event_counts(&self) -> Vec<EventCount> {
        self.counters
            .lock()
            .iter()
            .map(|((subscription_id, kind), count)| EventCount {
                subscription_id: subscription_id.clone(),
                kind: *kind,
                count: *count,
            })
            .collect()
    }

    /// Dump the counters at debug level.
    pub fn log_counts(&self) {
        for c in self.event_counts() {
            debug!(subscription_id = %c.subscription_id, kind = c.kind, count = c.count, "Event count");
        }
    }

    pub fn reset_counts(&self) {
        self.counters.lock().clear();
    }

    fn enqueue<F>(&self, what: &'static str, f: F)
    where
        F: FnOnce(&Dispatcher, &Background) + Send + 'static,
    {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        if self.worker.execute(move |bg| f(&*this, bg)).is_err() {
            trace!(what, "Worker stopped, dropping relay callback");
        }
    }

    fn ingest(&self, bg: &Background, event: Event, subscription_id: &str, relay: &str) {
        if !self.registry.contains(subscription_id) {
            trace!(subscription_id, relay, "Event for unknown subscription dropped");
            return;
        }
        if self.config.verify_event_ids {
            if let Err(e) = event.verify_id() {
                warn!(relay, error = %e, "Event dropped");
                return;
            }
        }

        *self
            .counters
            .lock()
            .entry((subscription_id.to_string(), event.kind))
            .or_insert(0) += 1;

        self.route(bg, &event);
    }

    fn route(&self, bg: &Background, event: &Event) {
        let class = event.kind_class();
        let result = match class {
            KindClass::Ephemeral => {
                trace!(id = %event.id, kind = event.kind, "Ephemeral event not stored");
                return;
            }
            KindClass::Regular => self.store.insert(bg, event).map(|_| ()),
            KindClass::Replaceable => self.store.replace(bg, event, None).map(|_| ()),
            KindClass::Addressable => self
                .store
                .replace(bg, event, Some(event.d_tag()))
                .map(|_| ()),
            KindClass::Deletion => self.apply_deletion(bg, event),
        };
        if let Err(e) = result {
            warn!(id = %event.id, ?class, error = %e, "Failed to store event");
        }
    }

    /// Store a deletion record and remove the referenced events by the same author.
    fn apply_deletion(&self, bg: &Background, deletion: &Event) -> crate::error::Result<()> {
        if !self.store.insert(bg, deletion)? {
            return Ok(());
        }
        let referenced: Vec<String> = deletion.tag_values("e").map(str::to_string).collect();
        if referenced.is_empty() {
            return Ok(());
        }
        let owned: Vec<String> = self
            .store
            .get_by_ids(&referenced)?
            .into_iter()
            .filter(|e| e.author == deletion.author && e.kind_class() != KindClass::Deletion)
            .map(|e| e.id)
            .collect();
        let removed = self.store.delete_by_ids(bg, &owned)?;
        debug!(id = %deletion.id, removed, "Applied deletion");
        Ok(())
    }

    fn eose(&self, subscription_id: &str, relay: &str) {
        match self.registry.get(subscription_id) {
            Some(channel) => {
                let time = Timestamp::now_minus(self.config.eose_clock_skew);
                trace!(subscription_id, relay, %time, "EOSE");
                channel.update_eose(time, relay);
            }
            None => trace!(subscription_id, relay, "EOSE for unknown subscription dropped"),
        }
    }

    fn invalidate_attached(&self, relay: &str) {
        let coordinators: Vec<Arc<SubscriptionCoordinator>> = self
            .coordinators
            .read()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        debug!(relay, coordinators = coordinators.len(), "Relay connected, invalidating feeds");
        for coordinator in coordinators {
            if let Err(e) = coordinator.invalidate_filters() {
                warn!(coordinator = coordinator.name(), error = %e, "Invalidation failed");
            }
        }
    }
}

impl RelayListener for Dispatcher {
    fn on_event(&self, event: Event, subscription_id: &str, relay: &str) {
        let subscription_id = subscription_id.to_string();
        let relay = relay.to_string();
        self.enqueue("event", move |this, bg| {
            this.ingest(bg, event, &subscription_id, &relay)
        });
    }

    fn on_eose(&self, subscription_id: &str, relay: &str) {
        let subscription_id = subscription_id.to_string();
        let relay = relay.to_string();
        self.enqueue("eose", move |this, _bg| this.eose(&subscription_id, &relay));
    }

    fn on_error(&self, relay: &str, error: RelayError) {
        warn!(relay, %error, "Relay error");
        if let Some(hook) = &self.hooks.on_error {
            hook(relay, &error);
        }
    }

    fn on_connection_state(&self, relay: &str, state: ConnectionState) {
        let previous = self.relays.write().insert(relay.to_string(), state);
        debug!(relay, ?previous, ?state, "Relay connection state");
        if state == ConnectionState::Connected && previous != Some(ConnectionState::Connected) {
            self.invalidate_attached(relay);
        }
    }

    fn on_auth(&self, relay: &str, challenge: &str) {
        if let Some(hook) = &self.hooks.on_auth {
            hook(relay, challenge);
        }
    }

    fn on_notify(&self, relay: &str, message: &str) {
        if let Some(hook) = &self.hooks.on_notify {
            hook(relay, message);
        }
    }

    fn on_send_response(&self, relay: &str, event_id: &str, accepted: bool, message: &str) {
        if !accepted {
            debug!(relay, event_id, message, "Event rejected by relay");
        }
        if let Some(hook) = &self.hooks.on_send_response {
            hook(relay, event_id, accepted, message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Tag;

    fn dispatcher() -> (Arc<Dispatcher>, Arc<ChannelRegistry>, Arc<EventStore>, Arc<BackgroundWorker>) {
        let registry = Arc::new(ChannelRegistry::new());
        let store = Arc::new(EventStore::in_memory(0).unwrap());
        let worker = Arc::new(BackgroundWorker::spawn("test", Duration::from_millis(10)).unwrap());
        let dispatcher = Dispatcher::new(
            registry.clone(),
            store.clone(),
            worker.clone(),
            DispatchConfig::default(),
            DispatchHooks::default(),
        );
        (dispatcher, registry, store, worker)
    }

    fn event(id: &str, kind: u32, tags: Vec<Tag>) -> Event {
        Event {
            id: id.to_string(),
            author: "alice".to_string(),
            created_at: Timestamp(100),
            kind,
            tags,
            content: String::new(),
            signature: "sig".to_string(),
        }
    }

    #[test]
    fn test_unknown_subscription_dropped() {
        let (dispatcher, _registry, store, worker) = dispatcher();
        dispatcher.on_event(event("a", 1, vec![]), "nobody-1", "wss://a");
        worker.flush().unwrap();

        assert_eq!(store.count_all().unwrap(), 0);
        assert!(dispatcher.event_counts().is_empty());
    }

    #[test]
    fn test_counts_per_subscription_and_kind() {
        let (dispatcher, registry, store, worker) = dispatcher();
        let channel = registry.allocate("home", None);
        let sub = channel.id().as_str();

        dispatcher.on_event(event("a", 1, vec![]), sub, "wss://a");
        dispatcher.on_event(event("a", 1, vec![]), sub, "wss://b");
        dispatcher.on_event(event("b", 7, vec![]), sub, "wss://a");
        worker.flush().unwrap();

        assert_eq!(store.count_all().unwrap(), 2);
        let counts = dispatcher.event_counts();
        assert_eq!(counts.len(), 2);
        assert_eq!(counts[0].count, 2);
        assert_eq!(counts[1].kind, 7);
    }

    #[test]
    fn test_ephemeral_events_not_stored() {
        let (dispatcher, registry, store, worker) = dispatcher();
        let channel = registry.allocate("home", None);

        dispatcher.on_event(event("typing", 20001, vec![]), channel.id().as_str(), "wss://a");
        worker.flush().unwrap();

        assert_eq!(store.count_all().unwrap(), 0);
        assert_eq!(dispatcher.event_counts()[0].count, 1);
    }

    #[test]
    fn test_replaceable_keeps_newest_version() {
        let (dispatcher, registry, store, worker) = dispatcher();
        let channel = registry.allocate("profile", None);
        let sub = channel.id().as_str();

        let mut newer = event("meta-new", 0, vec![]);
        newer.created_at = Timestamp(200);
        dispatcher.on_event(event("meta-old", 0, vec![]), sub, "wss://a");
        dispatcher.on_event(newer, sub, "wss://a");
        dispatcher.on_event(event("meta-old", 0, vec![]), sub, "wss://b");
        worker.flush().unwrap();

        let kept: Vec<String> = store
            .get_by_author_kind("alice", 0)
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(kept, vec!["meta-new"]);
    }

    #[test]
    fn test_deletion_removes_own_events() {
        let (dispatcher, registry, store, worker) = dispatcher();
        let channel = registry.allocate("home", None);
        let sub = channel.id().as_str();

        dispatcher.on_event(event("note", 1, vec![]), sub, "wss://a");
        let mut foreign = event("foreign", 1, vec![]);
        foreign.author = "bob".to_string();
        dispatcher.on_event(foreign, sub, "wss://a");
        dispatcher.on_event(
            event("del", KindClass::DELETION_KIND, vec![Tag::new(["e", "note"]), Tag::new(["e", "foreign"])]),
            sub,
            "wss://a",
        );
        worker.flush().unwrap();

        assert!(!store.contains("note").unwrap());
        assert!(store.contains("foreign").unwrap());
        assert!(store.contains("del").unwrap());
    }

    #[test]
    fn test_eose_reaches_channel() {
        let (dispatcher, registry, _store, worker) = dispatcher();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let channel = registry.allocate(
            "home",
            Some(Box::new(move |time: Timestamp, relay: &str| {
                sink.lock().push((time, relay.to_string()))
            })),
        );

        dispatcher.on_eose(channel.id().as_str(), "wss://a");
        dispatcher.on_eose("gone-9", "wss://a");
        worker.flush().unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, "wss://a");
        assert!(seen[0].0 <= Timestamp::now_minus(Duration::from_secs(59)));
    }

    #[test]
    fn test_error_hook_invoked() {
        let registry = Arc::new(ChannelRegistry::new());
        let store = Arc::new(EventStore::in_memory(0).unwrap());
        let worker = Arc::new(BackgroundWorker::spawn("test", Duration::from_millis(10)).unwrap());
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let dispatcher = Dispatcher::new(
            registry,
            store,
            worker,
            DispatchConfig::default(),
            DispatchHooks {
                on_error: Some(Box::new(move |relay: &str, error: &RelayError| {
                    sink.lock().push(format!("{relay}: {error}"))
                })),
                ..Default::default()
            },
        );

        dispatcher.on_error("wss://a", RelayError::Connect("refused".into()));
        assert_eq!(*errors.lock(), vec!["wss://a: Connect failed: refused"]);
    }
}
