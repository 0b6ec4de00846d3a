//! Protocol error types.

use thiserror::Error;

/// Protocol-level errors.
///
/// These are reported to the offending client only; they never tear down a
/// session.
#[derive(Debug, Error)]
pub enum Error {
    /// The frame is not a valid JSON envelope.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// The payload does not match the shape required by its event type.
    #[error("invalid payload for {event_type}: {reason}")]
    InvalidPayload { event_type: String, reason: String },

    /// A required payload field is absent or empty.
    #[error("{field} required for {event_type} payload")]
    MissingField {
        event_type: &'static str,
        field: &'static str,
    },

    /// The envelope carries a type this server does not know.
    #[error("invalid payload detected: unknown payload type")]
    UnknownEventType,

    /// The envelope type is known but not accepted from clients.
    #[error("payload type {0} cannot be sent by clients")]
    UnexpectedEventType(String),

    /// A database notification could not be decoded into a change event.
    #[error("invalid change notification: {0}")]
    InvalidNotification(String),

    /// Serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}
