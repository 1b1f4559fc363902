//! Wire frames exchanged with relays.
//!
//! This is the mapping boundary between raw relay text and [`Event`]s: a frame
//! whose event carries a non-string tag element is rejected here, before it can
//! reach the store.

use crate::error::{Result, SyncError};
use crate::filters::Filter;
use crate::types::Event;
use serde_json::Value;

/// Default cap on filters packed into one `REQ`.
pub const DEFAULT_MAX_FILTERS_PER_REQUEST: usize = 20;

/// Build a `["REQ", id, filter...]` frame, keeping at most `max_filters` filters.
pub fn req_frame(subscription_id: &str, filters: &[Filter], max_filters: usize) -> Result<String> {
    let mut frame: Vec<Value> = Vec::with_capacity(filters.len().min(max_filters) + 2);
    frame.push(Value::from("REQ"));
    frame.push(Value::from(subscription_id));
    for filter in filters.iter().take(max_filters) {
        frame.push(serde_json::to_value(filter)?);
    }
    if filters.len() > max_filters {
        tracing::warn!(
            subscription_id,
            dropped = filters.len() - max_filters,
            "REQ exceeds filter cap, extra filters dropped"
        );
    }
    Ok(serde_json::to_string(&frame)?)
}

/// Build a `["CLOSE", id]` frame.
pub fn close_frame(subscription_id: &str) -> Result<String> {
    Ok(serde_json::to_string(&("CLOSE", subscription_id))?)
}

/// A message received from a relay.
#[derive(Clone, Debug, PartialEq)]
pub enum RelayMessage {
    Event { subscription_id: String, event: Event },
    Eose { subscription_id: String },
    Notice { message: String },
    Ok { event_id: String, accepted: bool, message: String },
    Auth { challenge: String },
    Notify { message: String },
    Closed { subscription_id: String, message: String },
}

impl RelayMessage {
    /// Parse one text frame.
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| SyncError::MalformedMessage(format!("invalid json: {e}")))?;
        let items = value
            .as_array()
            .ok_or_else(|| SyncError::MalformedMessage("frame is not an array".into()))?;
        let label = string_at(items, 0)?;

        let message = match label {
            "EVENT" => {
                let subscription_id = string_at(items, 1)?.to_string();
                let raw = items
                    .get(2)
                    .cloned()
                    .ok_or_else(|| SyncError::MalformedMessage("EVENT without body".into()))?;
                let event: Event = serde_json::from_value(raw)
                    .map_err(|e| SyncError::MalformedMessage(format!("bad event: {e}")))?;
                RelayMessage::Event {
                    subscription_id,
                    event,
                }
            }
            "EOSE" => RelayMessage::Eose {
                subscription_id: string_at(items, 1)?.to_string(),
            },
            "NOTICE" => RelayMessage::Notice {
                message: string_at(items, 1)?.to_string(),
            },
            "OK" => RelayMessage::Ok {
                event_id: string_at(items, 1)?.to_string(),
                accepted: items.get(2).and_then(Value::as_bool).ok_or_else(|| {
                    SyncError::MalformedMessage("OK without boolean status".into())
                })?,
                message: optional_string_at(items, 3),
            },
            "AUTH" => RelayMessage::Auth {
                challenge: string_at(items, 1)?.to_string(),
            },
            "NOTIFY" => RelayMessage::Notify {
                message: string_at(items, 1)?.to_string(),
            },
            "CLOSED" => RelayMessage::Closed {
                subscription_id: string_at(items, 1)?.to_string(),
                message: optional_string_at(items, 2),
            },
            other => {
                return Err(SyncError::MalformedMessage(format!(
                    "unknown message type {other}"
                )))
            }
        };
        Ok(message)
    }
}

fn string_at(items: &[Value], index: usize) -> Result<&str> {
    items
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::MalformedMessage(format!("missing string at position {index}")))
}

fn optional_string_at(items: &[Value], index: usize) -> String {
    items
        .get(index)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
