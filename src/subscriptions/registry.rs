//! Shared registry of live channel identities.

use super::channel::{ChannelId, EoseCallback, FilterChannel};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Every channel registered by any coordinator of one session.
///
/// The dispatcher consults it to decide whether an inbound subscription id is
/// still wanted.
pub struct ChannelRegistry {
    channels: RwLock<HashMap<ChannelId, Arc<FilterChannel>>>,
    /// Counter for generating channel ids.
    next_id: AtomicU64,
    next_owner: AtomicU64,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            next_owner: AtomicU64::new(1),
        }
    }

    /// Allocate and register a fresh channel named after `prefix`.
    pub fn allocate(&self, prefix: &str, on_eose: Option<EoseCallback>) -> Arc<FilterChannel> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = ChannelId(format!("{prefix}-{n}"));
        let channel = Arc::new(FilterChannel::new(id.clone(), on_eose));
        self.channels.write().insert(id, channel.clone());
        channel
    }

    /// Key identifying one coordinator sharing this registry.
    pub(crate) fn next_owner_key(&self) -> u64 {
        self.next_owner.fetch_add(1, Ordering::SeqCst)
    }

    pub fn remove(&self, id: &ChannelId) -> Option<Arc<FilterChannel>> {
        self.channels.write().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<FilterChannel>> {
        self.channels.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Get channel count.
    pub fn len(&self) -> usize {
        self.channels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
