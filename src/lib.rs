//! # Feed Sync
//!
//! Client-side sync core for pub/sub relay networks: keeps server-side
//! subscriptions consistent with what the app wants to show, records how far
//! each relay has delivered its backlog, and stores what arrives.
//!
//! ## Core Concepts
//!
//! - **Channels**: one subscription id each, carrying the filters last issued under it
//! - **Coordinators**: reconcile a feed's channels against relays with minimal close/send traffic
//! - **Watermarks**: per (account, feed, relay) EOSE times, read back as `since` bounds
//! - **Store**: idempotent relational storage of events and their variable-arity tags
//! - **Background**: long-running work only runs on the session worker
//!
//! ## Example
//!
//! ```ignore
//! use feedsync::{EventStore, StoreConfig, SyncConfig, SyncSession, WatermarkTable};
//!
//! let store = Arc::new(EventStore::open(StoreConfig {
//!     path: "./events.db".into(),
//!     ..Default::default()
//! })?);
//! let session = SyncSession::login(
//!     pubkey,
//!     store,
//!     Arc::new(WatermarkTable::new()),
//!     relay_pool.clone(),
//!     SyncConfig::default(),
//!     Default::default(),
//! )?;
//! relay_pool.set_listener(session.listener());
//!
//! let home = session.coordinator("home", home_filters);
//! let channel = home.request_new_channel(Some(session.eose_recorder("home")));
//! home.start()?;
//! ```

pub mod error;
pub mod filters;
pub mod records;
pub mod session;
pub mod store;
pub mod subscriptions;
pub mod types;
pub mod watermarks;
pub mod worker;

// Re-exports
pub use error::{Result, SyncError};
pub use filters::{FeedType, Filter, FilterSet, RelayMessage, TypedFilter};
pub use session::{SyncConfig, SyncSession};
pub use store::{BatchOutcome, EventStore, StoreConfig};
pub use subscriptions::{
    ChannelId, ChannelRegistry, ConnectionState, DesiredFilters, DispatchConfig, DispatchHooks,
    Dispatcher, EoseCallback, EventCount, FilterChannel, FilterProducer, RelayError, RelayLink,
    RelayListener, SubscriptionCoordinator,
};
pub use types::*;
pub use watermarks::WatermarkTable;
pub use worker::{Background, BackgroundWorker, Reconcile};
