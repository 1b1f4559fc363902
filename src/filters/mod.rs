//! Filter descriptors and relay wire frames.
//!
//! The reconciler treats filters as opaque values compared by their canonical
//! serialization; the store and in-memory matching interpret them.
//!
//! # Example
//!
//! ```ignore
//! let home = TypedFilter::new(
//!     [FeedType::Follows],
//!     Filter::new().kinds([1, 6]).authors(follows).limit(400),
//! )
//! .with_since_per_relay(watermarks.since_map(&user, "home"));
//! ```

mod types;
pub mod wire;

pub use types::{FeedType, Filter, FilterSet, TypedFilter, COMMON_FEED_TYPES};
pub use wire::{close_frame, req_frame, RelayMessage, DEFAULT_MAX_FILTERS_PER_REQUEST};
