//! Watermark table implementation.

use crate::error::{Result, SyncError};
use crate::types::{FeedKey, RelayUrl, Timestamp, UserKey};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use tracing::debug;

/// Magic bytes for watermark snapshot files.
const WATERMARK_MAGIC: &[u8; 4] = b"WMK\0";

/// Current snapshot format version.
const WATERMARK_VERSION: u8 = 1;
/// Magic, version byte and u64 payload length.
const SNAPSHOT_HEADER_LEN: u64 = 4 + 1 + 8;
/// crc32 of the payload.
const SNAPSHOT_TRAILER_LEN: u64 = 4;

type Ledger = HashMap<UserKey, HashMap<FeedKey, HashMap<RelayUrl, Timestamp>>>;

/// EOSE ledger keyed by (account, feed, relay).
#[derive(Default)]
pub struct WatermarkTable {
    entries: RwLock<Ledger>,
}

impl WatermarkTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `timestamp` for the triple, overwriting any previous value.
    pub fn add_or_update(&self, user: &str, feed: &str, relay: &str, timestamp: Timestamp) {
        self.entries
            .write()
            .entry(user.to_string())
            .or_default()
            .entry(feed.to_string())
            .or_default()
            .insert(relay.to_string(), timestamp);
    }

    /// Record `timestamp` only if it is newer than the stored one.
    ///
    /// Returns whether the watermark moved.
    pub fn advance(&self, user: &str, feed: &str, relay: &str, timestamp: Timestamp) -> bool {
        let mut entries = self.entries.write();
        let slot = entries
            .entry(user.to_string())
            .or_default()
            .entry(feed.to_string())
            .or_default()
            .entry(relay.to_string())
            .or_insert(Timestamp(0));
        if timestamp > *slot {
            *slot = timestamp;
            true
        } else {
            false
        }
    }

    pub fn get(&self, user: &str, feed: &str, relay: &str) -> Option<Timestamp> {
        self.entries
            .read()
            .get(user)?
            .get(feed)?
            .get(relay)
            .copied()
    }

    /// Every relay's watermark for one feed, ready for a per-relay `since`.
    pub fn since_map(&self, user: &str, feed: &str) -> Option<BTreeMap<RelayUrl, Timestamp>> {
        let entries = self.entries.read();
        let relays = entries.get(user)?.get(feed)?;
        if relays.is_empty() {
            return None;
        }
        Some(relays.iter().map(|(r, t)| (r.clone(), *t)).collect())
    }

    /// Forget everything recorded for `user`.
    pub fn remove_all(&self, user: &str) {
        if let Some(feeds) = self.entries.write().remove(user) {
            debug!(user, feeds = feeds.len(), "Cleared watermarks");
        }
    }

    /// Number of (account, feed, relay) entries.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .values()
            .flat_map(|feeds| feeds.values())
            .map(|relays| relays.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write a snapshot of the table to `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let encoded = rmp_serde::to_vec(&*self.entries.read())?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;

        file.write_all(WATERMARK_MAGIC)?;
        file.write_all(&[WATERMARK_VERSION])?;
        file.write_all(&(encoded.len() as u64).to_le_bytes())?;
        file.write_all(&encoded)?;
        file.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;

        file.sync_all()?;
        Ok(())
    }

    /// Read a snapshot written by [`save`](Self::save).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = File::open(path.as_ref())?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != WATERMARK_MAGIC {
            return Err(SyncError::InvalidFormat("Invalid watermark magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != WATERMARK_VERSION {
            return Err(SyncError::InvalidFormat(format!(
                "Unsupported watermark version: {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes);
        let available = file
            .metadata()?
            .len()
            .saturating_sub(SNAPSHOT_HEADER_LEN + SNAPSHOT_TRAILER_LEN);
        if len > available {
            return Err(SyncError::InvalidFormat(format!(
                "Watermark payload length {len} exceeds file ({available} bytes available)"
            )));
        }

        let mut encoded = vec![0u8; len as usize];
        file.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let expected = u32::from_le_bytes(checksum_bytes);
        let got = crc32fast::hash(&encoded);
        if expected != got {
            return Err(SyncError::ChecksumMismatch { expected, got });
        }

        let entries: Ledger = rmp_serde::from_slice(&encoded)?;
        Ok(Self {
            entries: RwLock::new(entries),
        })
    }
}
