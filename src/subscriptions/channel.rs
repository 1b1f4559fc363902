//! Filter channels: one server-side subscription identity each.

use crate::filters::FilterSet;
use crate::types::Timestamp;
use parking_lot::Mutex;
use std::borrow::Borrow;
use std::fmt;

/// Subscription id shared by a channel and its wire-level subscription.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub String);

impl ChannelId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({})", self.0)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ChannelId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ChannelId {
    fn from(id: &str) -> Self {
        ChannelId(id.to_string())
    }
}

/// Called with (EOSE time, relay url) when a relay finishes the stored backlog.
pub type EoseCallback = Box<dyn Fn(Timestamp, &str) + Send + Sync>;

/// A subscription identity plus the filters last issued under it.
///
/// Filters are `None` while the channel is inactive.
pub struct FilterChannel {
    id: ChannelId,
    filters: Mutex<Option<FilterSet>>,
    on_eose: Option<EoseCallback>,
}

impl FilterChannel {
    pub(crate) fn new(id: ChannelId, on_eose: Option<EoseCallback>) -> Self {
        Self {
            id,
            filters: Mutex::new(None),
            on_eose,
        }
    }

    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    /// Filters currently issued under this channel.
    pub fn filters(&self) -> Option<FilterSet> {
        self.filters.lock().clone()
    }

    /// Whether the channel has a non-empty filter set.
    pub fn is_active(&self) -> bool {
        self.filters.lock().as_ref().is_some_and(|f| !f.is_empty())
    }

    pub(crate) fn set_filters(&self, filters: Option<FilterSet>) {
        *self.filters.lock() = filters;
    }

    /// Forward an EOSE to the channel's callback, if any.
    pub fn update_eose(&self, time: Timestamp, relay: &str) {
        if let Some(callback) = &self.on_eose {
            callback(time, relay);
        }
    }
}

impl fmt::Debug for FilterChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterChannel")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .field("has_eose_callback", &self.on_eose.is_some())
            .finish()
    }
}
