//! pgrt protocol types.
//!
//! This crate defines what crosses the wire between the realtime hub and its
//! clients, and what the database notify trigger publishes. It does no I/O.
//!
//! # Modules
//!
//! - [`event`] - The `{payload_type, payload}` envelope and its payloads
//! - [`change`] - Row change events decoded from notify payloads
//! - [`error`] - Protocol error types

pub mod change;
pub mod error;
pub mod event;

pub use error::Error;

// Re-export commonly used types at crate root
pub use change::{ChangeAction, ChangeEvent};
pub use event::{
    ConnectionPayload, EventType, MessagePayload, SocketEvent, SubscribePayload,
    UnsubscribePayload,
};
