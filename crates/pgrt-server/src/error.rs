//! Server error types.

use std::time::Duration;

use thiserror::Error;

use crate::hub::SessionId;

/// Server errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Broadcast or emit was called with a `null` or empty payload.
    #[error("payload cannot be nil or empty")]
    EmptyPayload,

    /// No active session with this id.
    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    /// The session's outbound queue is already closed.
    #[error("session {0} is closed")]
    SessionClosed(SessionId),

    /// The session is not draining its outbound queue fast enough.
    #[error("outbound queue full for session {0}")]
    QueueFull(SessionId),

    /// Illegal session state transition.
    #[error("invalid session transition from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    /// The registry loop is gone.
    #[error("session registry has shut down")]
    HubClosed,

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] pgrt_proto::Error),

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A table, function or channel name that cannot be used in DDL.
    #[error("invalid SQL identifier: {0:?}")]
    InvalidIdentifier(String),
}

/// Errors that end a change listener run.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Could not connect or issue `LISTEN`.
    #[error("failed to listen on channel {channel}: {source}")]
    Connect {
        channel: String,
        #[source]
        source: sqlx::Error,
    },

    /// Receiving from the notify channel failed.
    #[error("notification receive failed: {0}")]
    Receive(#[source] sqlx::Error),

    /// The idle liveness probe failed.
    #[error("liveness probe failed: {0}")]
    Probe(#[source] sqlx::Error),

    /// A notification payload was not a valid change event.
    #[error("failed to decode notification: {0}")]
    Decode(#[from] pgrt_proto::Error),

    /// Nobody is consuming change events any more.
    #[error("change event consumer dropped")]
    ConsumerClosed,

    /// The supervisor gave up reconnecting.
    #[error("listener gave up after {attempts} attempts (last backoff {last_backoff:?})")]
    RetriesExhausted {
        attempts: u32,
        last_backoff: Duration,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
