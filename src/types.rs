//! Core types shared by the store, the ledger and the reconciler.

use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Public key (hex) identifying the logged-in account that owns backfill state.
pub type UserKey = String;

/// Logical feed identifier inside one account (e.g. a follow-list code).
pub type FeedKey = String;

/// Normalized relay url.
pub type RelayUrl = String;

/// Seconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Timestamp(secs)
    }

    /// Current time shifted back by `skew`, clamped at the epoch.
    pub fn now_minus(skew: Duration) -> Self {
        Timestamp(Self::now().0.saturating_sub(skew.as_secs()))
    }

    pub fn as_secs(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Variable-arity annotation attached to an event.
///
/// The first element names the tag (`p`, `e`, `t`, ...), the rest carry its data.
/// Tags are kept verbatim so custom or oversized tags survive storage.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Tag(pub Vec<String>);

impl Tag {
    pub fn new<I, S>(elements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Tag(elements.into_iter().map(Into::into).collect())
    }

    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One immutable signed record from the network.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Content-derived hash (hex sha256).
    pub id: String,
    /// Author public key (hex).
    #[serde(rename = "pubkey")]
    pub author: String,
    pub created_at: Timestamp,
    pub kind: u32,
    pub tags: Vec<Tag>,
    pub content: String,
    #[serde(rename = "sig")]
    pub signature: String,
}

impl Event {
    /// Compute the content hash this event's `id` is expected to carry.
    ///
    /// Hash input is the compact JSON array
    /// `[0, pubkey, created_at, kind, tags, content]`.
    pub fn compute_id(&self) -> Result<String, serde_json::Error> {
        let commitment = serde_json::to_string(&(
            0u8,
            &self.author,
            self.created_at.0,
            self.kind,
            &self.tags,
            &self.content,
        ))?;
        let mut hasher = Sha256::new();
        hasher.update(commitment.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }

    /// Check `id` against the recomputed content hash.
    pub fn verify_id(&self) -> crate::error::Result<()> {
        let computed = self.compute_id()?;
        if computed != self.id {
            return Err(SyncError::EventIdMismatch {
                expected: computed,
                got: self.id.clone(),
            });
        }
        Ok(())
    }

    /// Whether `id` matches the recomputed content hash.
    pub fn has_valid_id(&self) -> bool {
        self.verify_id().is_ok()
    }

    /// Address of an addressable event: its first `d` tag's value, empty when absent.
    pub fn d_tag(&self) -> &str {
        self.tags
            .iter()
            .find(|t| t.name() == Some("d"))
            .and_then(Tag::value)
            .unwrap_or("")
    }

    pub fn kind_class(&self) -> KindClass {
        KindClass::of(self.kind)
    }

    /// Values of all tags named `name`, in tag order.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.name() == Some(name))
            .filter_map(Tag::value)
    }
}

/// Application-level class of an event kind, by the protocol's kind ranges.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KindClass {
    /// Stored and never superseded.
    Regular,
    /// Kinds 0, 3 and 10000..20000: the newest per author supersedes older ones.
    Replaceable,
    /// Kinds 20000..30000: delivered live, never stored.
    Ephemeral,
    /// Kinds 30000..40000: the newest per (author, kind, `d` tag) supersedes.
    Addressable,
    /// Kind 5: asks for the author's earlier events it references to be dropped.
    Deletion,
}

impl KindClass {
    pub const DELETION_KIND: u32 = 5;

    pub fn of(kind: u32) -> Self {
        match kind {
            Self::DELETION_KIND => KindClass::Deletion,
            0 | 3 | 10_000..=19_999 => KindClass::Replaceable,
            20_000..=29_999 => KindClass::Ephemeral,
            30_000..=39_999 => KindClass::Addressable,
            _ => KindClass::Regular,
        }
    }
}
