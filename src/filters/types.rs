//! Filter descriptors and their canonical form.

use crate::types::{Event, RelayUrl, Timestamp};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};

/// A structured relay query. Every populated field narrows the match.
///
/// Serializes to the protocol's filter object, with tag constraints written as
/// `"#<name>": [values]`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Filter {
    pub ids: Option<Vec<String>>,
    pub authors: Option<Vec<String>>,
    pub kinds: Option<Vec<u32>>,
    /// Single-character tag name to accepted values.
    pub tags: Option<BTreeMap<char, Vec<String>>>,
    pub since: Option<Timestamp>,
    pub until: Option<Timestamp>,
    pub limit: Option<u32>,
    pub search: Option<String>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u32>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    /// Add (or extend) a tag constraint.
    pub fn tag<I, S>(mut self, name: char, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags
            .get_or_insert_with(BTreeMap::new)
            .entry(name)
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    pub fn since(mut self, since: Timestamp) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: Timestamp) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn search(mut self, text: impl Into<String>) -> Self {
        self.search = Some(text.into());
        self
    }

    /// True when no field constrains the query.
    pub fn is_empty(&self) -> bool {
        self == &Filter::default()
    }

    /// Check an event against this filter in memory.
    ///
    /// `limit` is ignored; `search` is a case-insensitive substring match on content.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| id == &event.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| a == &event.author) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        if let Some(tags) = &self.tags {
            for (name, values) in tags {
                let name = name.to_string();
                let hit = event
                    .tag_values(&name)
                    .any(|v| values.iter().any(|want| want == v));
                if !hit {
                    return false;
                }
            }
        }
        if let Some(search) = &self.search {
            let needle = search.to_lowercase();
            if !event.content.to_lowercase().contains(&needle) {
                return false;
            }
        }
        true
    }
}

impl Serialize for Filter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        if let Some(ids) = &self.ids {
            map.serialize_entry("ids", ids)?;
        }
        if let Some(authors) = &self.authors {
            map.serialize_entry("authors", authors)?;
        }
        if let Some(kinds) = &self.kinds {
            map.serialize_entry("kinds", kinds)?;
        }
        if let Some(tags) = &self.tags {
            for (name, values) in tags {
                map.serialize_entry(&format!("#{name}"), values)?;
            }
        }
        if let Some(since) = &self.since {
            map.serialize_entry("since", since)?;
        }
        if let Some(until) = &self.until {
            map.serialize_entry("until", until)?;
        }
        if let Some(limit) = &self.limit {
            map.serialize_entry("limit", limit)?;
        }
        if let Some(search) = &self.search {
            map.serialize_entry("search", search)?;
        }
        map.end()
    }
}

/// Which kind of feed a filter serves. Links use it to pick relays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedType {
    Follows,
    PublicChats,
    PrivateDms,
    Global,
    Search,
    WalletConnect,
}

/// Feed types most read relays serve.
pub const COMMON_FEED_TYPES: [FeedType; 4] = [
    FeedType::Follows,
    FeedType::PublicChats,
    FeedType::PrivateDms,
    FeedType::Global,
];

/// A filter tagged with the feed types it serves and optional per-relay `since`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TypedFilter {
    pub feed_types: BTreeSet<FeedType>,
    pub filter: Filter,
    /// Relay url to the lower bound for that relay; overrides `filter.since`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since_per_relay: Option<BTreeMap<RelayUrl, Timestamp>>,
}

impl TypedFilter {
    pub fn new(feed_types: impl IntoIterator<Item = FeedType>, filter: Filter) -> Self {
        Self {
            feed_types: feed_types.into_iter().collect(),
            filter,
            since_per_relay: None,
        }
    }

    /// Attach a per-relay `since` map. An empty map is treated as absent.
    pub fn with_since_per_relay(mut self, since: Option<BTreeMap<RelayUrl, Timestamp>>) -> Self {
        self.since_per_relay = since.filter(|m| !m.is_empty());
        self
    }

    pub fn serves(&self, feed_type: FeedType) -> bool {
        self.feed_types.contains(&feed_type)
    }

    /// The concrete filter to send to `relay`.
    pub fn for_relay(&self, relay: &str) -> Filter {
        let mut filter = self.filter.clone();
        if let Some(since) = self.since_per_relay.as_ref().and_then(|m| m.get(relay)) {
            filter.since = Some(*since);
        }
        filter
    }
}

/// The ordered filter list a channel subscribes with (OR across entries).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FilterSet(pub Vec<TypedFilter>);

impl FilterSet {
    pub fn new(filters: Vec<TypedFilter>) -> Self {
        FilterSet(filters)
    }

    /// `None` when the list is empty, mirroring "no filters means inactive".
    pub fn non_empty(filters: Vec<TypedFilter>) -> Option<Self> {
        if filters.is_empty() {
            None
        } else {
            Some(FilterSet(filters))
        }
    }

    pub fn filters(&self) -> &[TypedFilter] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Content-based serialization used to decide whether a subscription changed.
    pub fn canonical(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self))
    }

    /// Concrete filters for one relay, keeping only those serving one of `feed_types`.
    pub fn for_relay(&self, relay: &str, feed_types: &BTreeSet<FeedType>) -> Vec<Filter> {
        self.0
            .iter()
            .filter(|f| f.feed_types.iter().any(|t| feed_types.contains(t)))
            .map(|f| f.for_relay(relay))
            .collect()
    }
}

impl From<Vec<TypedFilter>> for FilterSet {
    fn from(filters: Vec<TypedFilter>) -> Self {
        FilterSet(filters)
    }
}
