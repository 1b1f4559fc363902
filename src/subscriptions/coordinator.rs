//! Subscription coordinator: keeps relay subscriptions in step with desired filters.

use super::channel::{ChannelId, EoseCallback, FilterChannel};
use super::link::RelayLink;
use super::registry::ChannelRegistry;
use crate::error::Result;
use crate::filters::FilterSet;
use crate::worker::{Background, BackgroundWorker, Reconcile};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// Desired filters per owned channel. A missing entry means "none".
pub type DesiredFilters = HashMap<ChannelId, Option<FilterSet>>;

/// Feed-specific strategy computing what each owned channel should subscribe to.
///
/// Called on the background worker while the coordinator's channel list is
/// locked; it must not call back into the coordinator.
pub trait FilterProducer: Send + Sync {
    fn desired_filters(&self, channels: &[ChannelId]) -> DesiredFilters;
}

impl<F> FilterProducer for F
where
    F: Fn(&[ChannelId]) -> DesiredFilters + Send + Sync,
{
    fn desired_filters(&self, channels: &[ChannelId]) -> DesiredFilters {
        self(channels)
    }
}

/// Owns the channels of one feed family and reconciles them against the relays.
pub struct SubscriptionCoordinator {
    name: String,
    /// Debounce key on the worker.
    key: u64,
    link: Arc<dyn RelayLink>,
    registry: Arc<ChannelRegistry>,
    worker: Arc<BackgroundWorker>,
    producer: Box<dyn FilterProducer>,
    /// Held for the whole snapshot-compute-diff pass.
    channels: Mutex<Vec<Arc<FilterChannel>>>,
    active: AtomicBool,
    this: Weak<SubscriptionCoordinator>,
}

impl SubscriptionCoordinator {
    /// Create a stopped coordinator.
    pub fn new(
        name: impl Into<String>,
        link: Arc<dyn RelayLink>,
        registry: Arc<ChannelRegistry>,
        worker: Arc<BackgroundWorker>,
        producer: impl FilterProducer + 'static,
    ) -> Arc<Self> {
        let key = registry.next_owner_key();
        Arc::new_cyclic(|this| Self {
            name: name.into(),
            key,
            link,
            registry,
            worker,
            producer: Box::new(producer),
            channels: Mutex::new(Vec::new()),
            active: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Ids of the channels this coordinator owns, in allocation order.
    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.channels.lock().iter().map(|c| c.id().clone()).collect()
    }

    /// Allocate a channel, register it and take ownership of it.
    pub fn request_new_channel(&self, on_eose: Option<EoseCallback>) -> Arc<FilterChannel> {
        let channel = self.registry.allocate(&self.name, on_eose);
        self.channels.lock().push(channel.clone());
        debug!(coordinator = %self.name, channel = %channel.id(), "Channel allocated");
        channel
    }

    /// Close the channel's subscription (if any) and forget the channel.
    pub fn dismiss_channel(&self, channel: &FilterChannel) {
        let id = channel.id();
        self.channels.lock().retain(|c| c.id() != id);
        self.registry.remove(id);

        if channel.is_active() || self.link.is_live(id) {
            self.link.close(id);
        }
        channel.set_filters(None);
        debug!(coordinator = %self.name, channel = %id, "Channel dismissed");
    }

    /// Schedule a reconciliation. Bursts inside the debounce window run once.
    pub fn invalidate_filters(&self) -> Result<()> {
        let target: Weak<dyn Reconcile> = self.this.clone();
        self.worker.invalidate(self.key, target)
    }

    /// Reconcile now on the background worker and wait for it to finish.
    pub fn reset_filters(&self) -> Result<()> {
        let Some(this) = self.this.upgrade() else {
            return Ok(());
        };
        self.worker.run_blocking(move |bg| this.reconcile(bg))
    }

    /// Mark active and send whatever the feed currently wants.
    pub fn start(&self) -> Result<()> {
        self.active.store(true, Ordering::SeqCst);
        debug!(coordinator = %self.name, "Starting");
        self.reset_filters()
    }

    /// Close every subscription and forget the filters behind them.
    ///
    /// Channels stay registered; `start` recomputes and sends their filters.
    pub fn stop(&self) -> Result<()> {
        self.active.store(false, Ordering::SeqCst);
        let Some(this) = self.this.upgrade() else {
            return Ok(());
        };
        self.worker.run_blocking(move |_bg| this.close_all())
    }

    fn close_all(&self) {
        let channels = self.channels.lock();
        let mut closed = 0;
        for channel in channels.iter() {
            if channel.is_active() {
                self.link.close(channel.id());
                channel.set_filters(None);
                closed += 1;
            }
        }
        debug!(coordinator = %self.name, closed, "Stopped");
    }
}

impl Reconcile for SubscriptionCoordinator {
    fn reconcile(&self, _bg: &Background) {
        let channels = self.channels.lock();

        let ids: Vec<ChannelId> = channels.iter().map(|c| c.id().clone()).collect();
        let previous: Vec<Option<String>> = channels
            .iter()
            .map(|c| c.filters().filter(|f| !f.is_empty()).map(|f| f.canonical()))
            .collect();

        let mut desired = self.producer.desired_filters(&ids);
        let active = self.is_active();

        for (channel, previous) in channels.iter().zip(previous) {
            let id = channel.id();
            let next = desired.remove(id).flatten().filter(|f| !f.is_empty());
            channel.set_filters(next.clone());

            match (previous, next) {
                (None, None) => {}
                (Some(_), None) => {
                    trace!(channel = %id, "Filters dropped, closing");
                    self.link.close(id);
                }
                (None, Some(next)) => {
                    if active {
                        trace!(channel = %id, "New filters, sending");
                        self.link.send(id, &next);
                    }
                }
                (Some(previous), Some(next)) => {
                    if previous != next.canonical() {
                        trace!(channel = %id, "Filters changed, resending");
                        self.link.close(id);
                        if active {
                            self.link.send(id, &next);
                        }
                    } else if active && !self.link.is_live(id) {
                        trace!(channel = %id, "Subscription not live, resending");
                        self.link.send(id, &next);
                    }
                }
            }
        }
    }

    fn debug_name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for SubscriptionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionCoordinator")
            .field("name", &self.name)
            .field("active", &self.is_active())
            .field("channels", &self.channel_ids())
            .finish()
    }
}
