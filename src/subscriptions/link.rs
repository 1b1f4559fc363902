//! Relay transport seam.
//!
//! [`RelayLink`] is what coordinators drive; [`RelayListener`] is what the
//! transport calls back into. Transports own sockets, reconnects and per-relay
//! threads; none of that lives in this crate.

use super::channel::ChannelId;
use crate::error::Result;
use crate::filters::{req_frame, FeedType, FilterSet, RelayMessage};
use crate::types::Event;
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{debug, warn};

/// Outbound half of the relay pool.
///
/// Calls are fire-and-forget: implementations queue the frames and return.
pub trait RelayLink: Send + Sync {
    /// Open (or replace) the subscription `id` on every relay serving its filters.
    fn send(&self, id: &ChannelId, filters: &FilterSet);

    fn close(&self, id: &ChannelId);

    /// Whether a subscription `id` is currently open on a connected relay.
    fn is_live(&self, id: &ChannelId) -> bool;
}

/// Connection state of one relay.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

/// Transport failure on one relay. Reported through callbacks, never returned.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Read failed: {0}")]
    Read(String),

    #[error("Write failed: {0}")]
    Write(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Subscription {subscription_id} closed by relay: {message}")]
    Closed {
        subscription_id: String,
        message: String,
    },
}

/// Inbound callbacks from the relay pool. Invoked from any relay thread.
pub trait RelayListener: Send + Sync {
    fn on_event(&self, event: Event, subscription_id: &str, relay: &str);

    fn on_eose(&self, subscription_id: &str, relay: &str);

    fn on_error(&self, relay: &str, error: RelayError);

    fn on_connection_state(&self, relay: &str, state: ConnectionState);

    fn on_auth(&self, _relay: &str, _challenge: &str) {}

    fn on_notify(&self, _relay: &str, _message: &str) {}

    /// `OK` answer to a published event.
    fn on_send_response(&self, _relay: &str, _event_id: &str, _accepted: bool, _message: &str) {}
}

/// Parse one text frame received from `relay` and route it to `listener`.
///
/// Malformed frames are reported as a protocol error on that relay and
/// returned, so the transport may log or drop the connection.
pub fn deliver(listener: &dyn RelayListener, relay: &str, frame: &str) -> Result<()> {
    let message = match RelayMessage::parse(frame) {
        Ok(message) => message,
        Err(e) => {
            listener.on_error(relay, RelayError::Protocol(e.to_string()));
            return Err(e);
        }
    };

    match message {
        RelayMessage::Event {
            subscription_id,
            event,
        } => listener.on_event(event, &subscription_id, relay),
        RelayMessage::Eose { subscription_id } => listener.on_eose(&subscription_id, relay),
        RelayMessage::Notice { message } => debug!(relay, %message, "Relay notice"),
        RelayMessage::Ok {
            event_id,
            accepted,
            message,
        } => listener.on_send_response(relay, &event_id, accepted, &message),
        RelayMessage::Auth { challenge } => listener.on_auth(relay, &challenge),
        RelayMessage::Notify { message } => listener.on_notify(relay, &message),
        RelayMessage::Closed {
            subscription_id,
            message,
        } => {
            warn!(relay, subscription_id = %subscription_id, %message, "Subscription closed by relay");
            listener.on_error(
                relay,
                RelayError::Closed {
                    subscription_id,
                    message,
                },
            );
        }
    }
    Ok(())
}

/// `REQ` frame for `relay`, or `None` when no filter serves that relay's feed types.
pub fn req_for_relay(
    id: &ChannelId,
    filters: &FilterSet,
    relay: &str,
    relay_feed_types: &BTreeSet<FeedType>,
    max_filters: usize,
) -> Result<Option<String>> {
    let concrete = filters.for_relay(relay, relay_feed_types);
    if concrete.is_empty() {
        return Ok(None);
    }
    req_frame(id.as_str(), &concrete, max_filters).map(Some)
}
