//! Session registry (hub) and per-connection sessions.

mod registry;
mod session;

pub use registry::{Hub, SessionInfo};
pub use session::{ClientSession, SessionId, SessionState};
