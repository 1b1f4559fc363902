//! Relay subscription reconciliation.
//!
//! A feed family owns a [`SubscriptionCoordinator`], which owns
//! [`FilterChannel`]s. On every invalidation the coordinator asks its
//! [`FilterProducer`] for the filters each channel should carry, diffs them
//! against what was last issued, and drives the [`RelayLink`] with the minimal
//! set of `close`/`send` calls:
//!
//! | previous | desired   | action                                  |
//! |----------|-----------|-----------------------------------------|
//! | none     | none      | nothing                                 |
//! | some     | none      | close                                   |
//! | none     | some      | send                                    |
//! | some     | same      | send only if the subscription isn't live |
//! | some     | different | close, then send                        |
//!
//! Inbound traffic goes the other way through one shared [`Dispatcher`],
//! which drops anything addressed to a subscription id no coordinator owns.
//!
//! # Example
//!
//! ```ignore
//! let home = SubscriptionCoordinator::new("home", link, registry, worker, |ids: &[ChannelId]| {
//!     ids.iter().map(|id| (id.clone(), Some(home_filters()))).collect()
//! });
//! let channel = home.request_new_channel(None);
//! home.start()?;
//!
//! // later, after the follow list changed
//! home.invalidate_filters()?;
//! ```

mod channel;
mod coordinator;
mod dispatcher;
pub mod link;
mod registry;

pub use channel::{ChannelId, EoseCallback, FilterChannel};
pub use coordinator::{DesiredFilters, FilterProducer, SubscriptionCoordinator};
pub use dispatcher::{DispatchConfig, DispatchHooks, Dispatcher, EventCount};
pub use link::{ConnectionState, RelayError, RelayLink, RelayListener};
pub use registry::ChannelRegistry;
