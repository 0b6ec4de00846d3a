//! The socket envelope exchanged with clients in both directions.
//!
//! Every frame on the wire is one JSON object:
//!
//! ```text
//! { "payload_type": "<type>", "payload": <object|null> }
//! ```
//!
//! The payload is kept opaque in the envelope and decoded into a typed
//! struct by whoever handles that event type.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::change::ChangeEvent;
use crate::Error;

/// Discriminant of a [`SocketEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    /// A session joined the hub.
    Connect,
    /// A session left the hub.
    Disconnect,
    /// Client asks to receive changes for a table.
    Subscribe,
    /// Client stops receiving changes for a table.
    Unsubscribe,
    /// Server reply to a subscription, or a forwarded change.
    SubscriptionResponse,
    /// Server reply to a request it could not handle.
    Error,
    /// Any type string this server does not recognise.
    Unknown,
}

impl EventType {
    /// The wire name of this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Connect => "connect",
            EventType::Disconnect => "disconnect",
            EventType::Subscribe => "subscribe",
            EventType::Unsubscribe => "unsubscribe",
            EventType::SubscriptionResponse => "subscription:response",
            EventType::Error => "error",
            EventType::Unknown => "unknown",
        }
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "connect" => EventType::Connect,
            "disconnect" => EventType::Disconnect,
            "subscribe" => EventType::Subscribe,
            "unsubscribe" => EventType::Unsubscribe,
            "subscription:response" => EventType::SubscriptionResponse,
            "error" => EventType::Error,
            _ => EventType::Unknown,
        }
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of `connect` and `disconnect`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionPayload {
    pub user_id: Option<String>,
}

/// Payload of `subscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubscribePayload {
    /// Table to watch. Required.
    #[serde(default)]
    pub table_name: Option<String>,
    /// Columns to keep in forwarded rows. Empty means all columns.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<String>,
}

/// Payload of `unsubscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UnsubscribePayload {
    #[serde(default)]
    pub table_name: Option<String>,
}

/// Human readable payload used by confirmations and errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message: String,
}

/// The wire envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketEvent {
    /// Event discriminant.
    pub payload_type: EventType,
    /// Type dependent payload; `null` when absent.
    #[serde(default)]
    pub payload: Value,
}

impl SocketEvent {
    /// Create an envelope from a type and a raw payload.
    pub fn new(payload_type: EventType, payload: Value) -> Self {
        Self {
            payload_type,
            payload,
        }
    }

    /// Presence notification for a session joining.
    pub fn connect(user_id: Option<&str>) -> Self {
        Self::new(EventType::Connect, json!({ "user_id": user_id }))
    }

    /// Presence notification for a session leaving.
    pub fn disconnect(user_id: Option<&str>) -> Self {
        Self::new(EventType::Disconnect, json!({ "user_id": user_id }))
    }

    /// A subscribe request, as a client would send it.
    pub fn subscribe(table_name: &str, columns: &[&str]) -> Self {
        Self::new(
            EventType::Subscribe,
            json!({ "table_name": table_name, "columns": columns }),
        )
    }

    /// An unsubscribe request, as a client would send it.
    pub fn unsubscribe(table_name: &str) -> Self {
        Self::new(EventType::Unsubscribe, json!({ "table_name": table_name }))
    }

    /// A `subscription:response` confirmation message.
    pub fn message(message: impl Into<String>) -> Self {
        Self::new(
            EventType::SubscriptionResponse,
            json!({ "message": message.into() }),
        )
    }

    /// A `subscription:response` carrying a forwarded row change.
    pub fn change(event: &ChangeEvent) -> Self {
        Self::new(
            EventType::SubscriptionResponse,
            json!({
                "table": event.table,
                "action": event.action,
                "data": event.data,
            }),
        )
    }

    /// A protocol error reply.
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(EventType::Error, json!({ "message": message.into() }))
    }

    /// Whether the payload carries anything (`null` and `{}` do not).
    pub fn has_payload(&self) -> bool {
        match &self.payload {
            Value::Null => false,
            Value::Object(map) => !map.is_empty(),
            _ => true,
        }
    }

    /// Decode the payload into a typed struct.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_value(self.payload.clone()).map_err(|e| Error::InvalidPayload {
            event_type: self.payload_type.to_string(),
            reason: e.to_string(),
        })
    }

    /// Decode the payload as a forwarded change, if it is one.
    pub fn change_payload(&self) -> Option<ChangeEvent> {
        if self.payload_type != EventType::SubscriptionResponse {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }

    /// Encode to a JSON text frame.
    pub fn encode(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Decode a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, Error> {
        serde_json::from_str(text).map_err(|e| Error::MalformedEnvelope(e.to_string()))
    }
}
