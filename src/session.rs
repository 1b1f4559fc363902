//! Per-account sync session.
//!
//! Everything that used to be process-wide (feed coordinators, the EOSE ledger
//! view, the worker) hangs off one [`SyncSession`], created on login and torn
//! down on logout.

use crate::error::Result;
use crate::filters::{FeedType, FilterSet, DEFAULT_MAX_FILTERS_PER_REQUEST};
use crate::store::EventStore;
use crate::subscriptions::link::req_for_relay;
use crate::subscriptions::{
    ChannelId, ChannelRegistry, DispatchConfig, DispatchHooks, Dispatcher, EoseCallback,
    FilterProducer, RelayLink, RelayListener, SubscriptionCoordinator,
};
use crate::types::{RelayUrl, Timestamp, UserKey};
use crate::watermarks::WatermarkTable;
use crate::worker::{Background, BackgroundWorker};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, trace, warn};

/// Session configuration.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Invalidation bundling window.
    /// Default: 300ms
    pub debounce: Duration,

    /// EOSE times are stamped this far in the past to absorb relay clock skew.
    /// Default: 60s
    pub eose_clock_skew: Duration,

    /// Filters packed into one `REQ` at most.
    /// Default: 20
    pub max_filters_per_request: usize,

    /// Drop inbound events whose id does not hash-match their content.
    pub verify_event_ids: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(300),
            eose_clock_skew: Duration::from_secs(60),
            max_filters_per_request: DEFAULT_MAX_FILTERS_PER_REQUEST,
            verify_event_ids: false,
        }
    }
}

/// Sync state of one logged-in account.
pub struct SyncSession {
    user: UserKey,
    config: SyncConfig,
    store: Arc<EventStore>,
    watermarks: Arc<WatermarkTable>,
    registry: Arc<ChannelRegistry>,
    worker: Arc<BackgroundWorker>,
    link: Arc<dyn RelayLink>,
    dispatcher: Arc<Dispatcher>,
    coordinators: Mutex<Vec<Arc<SubscriptionCoordinator>>>,
}

impl SyncSession {
    /// Start a session for `user` over a shared store and ledger.
    pub fn login(
        user: impl Into<UserKey>,
        store: Arc<EventStore>,
        watermarks: Arc<WatermarkTable>,
        link: Arc<dyn RelayLink>,
        config: SyncConfig,
        hooks: DispatchHooks,
    ) -> Result<Self> {
        let user = user.into();
        let worker = Arc::new(BackgroundWorker::spawn(&short(&user), config.debounce)?);
        let registry = Arc::new(ChannelRegistry::new());
        let dispatcher = Dispatcher::new(
            registry.clone(),
            store.clone(),
            worker.clone(),
            DispatchConfig {
                eose_clock_skew: config.eose_clock_skew,
                verify_event_ids: config.verify_event_ids,
            },
            hooks,
        );

        info!(user = %user, "Sync session started");
        Ok(Self {
            user,
            config,
            store,
            watermarks,
            registry,
            worker,
            link,
            dispatcher,
            coordinators: Mutex::new(Vec::new()),
        })
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    pub fn watermarks(&self) -> &Arc<WatermarkTable> {
        &self.watermarks
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Listener to hand to the relay pool.
    pub fn listener(&self) -> Arc<dyn RelayListener> {
        self.dispatcher.clone()
    }

    /// Create a (stopped) coordinator for one feed family.
    pub fn coordinator(
        &self,
        name: &str,
        producer: impl FilterProducer + 'static,
    ) -> Arc<SubscriptionCoordinator> {
        let coordinator = SubscriptionCoordinator::new(
            name,
            self.link.clone(),
            self.registry.clone(),
            self.worker.clone(),
            producer,
        );
        self.dispatcher.attach(&coordinator);
        self.coordinators.lock().push(coordinator.clone());
        coordinator
    }

    /// EOSE callback advancing this account's watermark for `feed`.
    ///
    /// Runs on the worker, so the ledger update is ordered with reconciliation.
    pub fn eose_recorder(&self, feed: &str) -> EoseCallback {
        let watermarks = self.watermarks.clone();
        let user = self.user.clone();
        let feed = feed.to_string();
        Box::new(move |time: Timestamp, relay: &str| {
            if watermarks.advance(&user, &feed, relay, time) {
                trace!(feed = %feed, relay, %time, "Watermark advanced");
            }
        })
    }

    /// Per-relay `since` bounds for `feed`.
    pub fn since_map(&self, feed: &str) -> Option<BTreeMap<RelayUrl, Timestamp>> {
        self.watermarks.since_map(&self.user, feed)
    }

    /// `REQ` frame for one relay, honouring the session's filter cap.
    pub fn req_frame(
        &self,
        id: &ChannelId,
        filters: &FilterSet,
        relay: &str,
        relay_feed_types: &BTreeSet<FeedType>,
    ) -> Result<Option<String>> {
        req_for_relay(
            id,
            filters,
            relay,
            relay_feed_types,
            self.config.max_filters_per_request,
        )
    }

    /// Run `f` on the background worker and wait for its result.
    ///
    /// This is how hosts reach `&Background`-gated store writes.
    pub fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Background) -> T + Send + 'static,
    {
        self.worker.run_blocking(f)
    }

    /// Run all pending invalidations and wait for queued relay callbacks.
    pub fn flush(&self) -> Result<()> {
        self.worker.flush()
    }

    /// Stop every coordinator and the worker, then forget this account's watermarks.
    ///
    /// The worker drains its queue before stopping, so relay callbacks queued
    /// during shutdown land before the ledger is cleared and later ones are dropped.
    pub fn logout(self) -> Result<()> {
        let coordinators = std::mem::take(&mut *self.coordinators.lock());
        for coordinator in &coordinators {
            if let Err(e) = coordinator.stop() {
                warn!(coordinator = coordinator.name(), error = %e, "Failed to stop feed");
            }
        }
        self.worker.shutdown();
        self.watermarks.remove_all(&self.user);

        info!(user = %self.user, "Sync session closed");
        Ok(())
    }
}

/// Thread-name-friendly prefix of an account key.
fn short(user: &str) -> String {
    user.chars().take(8).collect()
}
