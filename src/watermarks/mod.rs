//! Per-relay EOSE watermarks.
//!
//! A watermark is the newest EOSE time a relay reported for one feed of one
//! account. Feeds read it back as a relay-specific `since` bound, so relays with
//! different histories are each asked only for what they have not yet sent.

mod table;

pub use table::WatermarkTable;
