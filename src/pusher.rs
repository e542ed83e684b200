//! Pusher Protocol Implementation
//!
//! Wire-compatible with the channel subset of the Pusher protocol.
//!
//! ## Client Events
//! - `pusher:ping`: Heartbeat request
//! - `pusher:subscribe`: Join a channel (private channels carry `auth`)
//! - `pusher:unsubscribe`: Leave a channel
//!
//! ## Server Events
//! - `pusher:connection_established`: Handshake with socket ID
//! - `pusher:pong`: Heartbeat reply
//! - `pusher_internal:subscription_succeeded`: Channel joined
//! - `pusher:error`: Protocol-level error
//!
//! Outbound frames are JSON objects `{event, channel, data}` where `data`
//! is always a string; structured payloads are JSON-serialized into it
//! first, as the protocol requires.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const CONNECTION_ESTABLISHED: &str = "pusher:connection_established";
pub const PING: &str = "pusher:ping";
pub const PONG: &str = "pusher:pong";
pub const SUBSCRIBE: &str = "pusher:subscribe";
pub const UNSUBSCRIBE: &str = "pusher:unsubscribe";
pub const SUBSCRIPTION_SUCCEEDED: &str = "pusher_internal:subscription_succeeded";
pub const ERROR: &str = "pusher:error";

/// Channels whose name starts with this prefix require a signed `auth`
/// field on subscribe.
pub const PRIVATE_PREFIX: &str = "private-";

/// Channels whose name starts with this prefix expose `user_count` in the
/// REST channel status.
pub const PRESENCE_PREFIX: &str = "presence-";

/// Advisory activity timeout sent in the handshake, in milliseconds.
pub const ACTIVITY_TIMEOUT_MS: u32 = 10000;

/// A client-to-server event. `data` may be a JSON object or a string
/// depending on the event.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientEvent {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// Payload of `pusher:subscribe` and `pusher:unsubscribe`.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionPayload {
    pub channel: String,
    #[serde(default)]
    pub auth: Option<String>,
}

/// Payload of the `pusher:connection_established` handshake frame.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConnectionEstablished {
    pub socket_id: String,
    pub activity_timeout: u32,
}

#[derive(Serialize)]
struct OutboundFrame<'a> {
    event: &'a str,
    channel: &'a str,
    data: String,
}

/// Parse a client event from a raw text frame.
pub fn parse_client_event(raw: &str) -> Result<ClientEvent, ProtocolError> {
    serde_json::from_str(raw).map_err(ProtocolError::Parse)
}

/// Extract the subscription payload from a subscribe/unsubscribe event.
///
/// Returns `None` when the data is not an object carrying a string
/// `channel`; such frames are answered with an "unrecognized message"
/// error rather than terminating the connection.
pub fn subscription_payload(data: &Value) -> Option<SubscriptionPayload> {
    if !data.is_object() {
        return None;
    }
    serde_json::from_value(data.clone()).ok()
}

/// Encode an outbound frame. Non-string data is JSON-serialized into the
/// `data` string as the protocol requires.
pub fn encode_frame(event: &str, channel: &str, data: &Value) -> Result<String, ProtocolError> {
    let data = match data {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).map_err(ProtocolError::Encode)?,
    };
    serde_json::to_string(&OutboundFrame {
        event,
        channel,
        data,
    })
    .map_err(ProtocolError::Encode)
}

/// Encode the handshake frame for a fresh connection.
pub fn encode_connection_established(socket_id: &str) -> Result<String, ProtocolError> {
    let payload = serde_json::to_value(ConnectionEstablished {
        socket_id: socket_id.to_string(),
        activity_timeout: ACTIVITY_TIMEOUT_MS,
    })
    .map_err(ProtocolError::Encode)?;
    encode_frame(CONNECTION_ESTABLISHED, "", &payload)
}

/// Pusher protocol errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to parse client event: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
}
