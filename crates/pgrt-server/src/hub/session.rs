//! Per-connection session state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use pgrt_proto::SocketEvent;

use crate::error::{Error, Result};

/// Identifier of a session within one hub.
pub type SessionId = u64;

/// Session lifecycle as tracked by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted, not yet in the active set.
    Connecting,
    /// In the active set, pumps running.
    Active,
    /// A pump failed or teardown was requested.
    Closing,
    /// Queue closed, connection released, removed from the active set.
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }

    /// Whether `next` directly follows this state. No state may be skipped.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (SessionState::Connecting, SessionState::Active)
                | (SessionState::Active, SessionState::Closing)
                | (SessionState::Closing, SessionState::Closed)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One client connection: identity, outbound queue and lifecycle state.
///
/// The physical connection itself is owned by the two pump tasks; the
/// session only holds what both pumps, the router and the registry share.
pub struct ClientSession {
    id: SessionId,
    identity: String,
    outbound: Mutex<Option<mpsc::Sender<SocketEvent>>>,
    state: Mutex<SessionState>,
    shutdown: watch::Sender<bool>,
    created_at: Instant,
    events_sent: AtomicU64,
}

impl ClientSession {
    /// Create a session and the receiving end of its outbound queue.
    ///
    /// The receiver belongs to the writer pump, which is its only consumer.
    pub fn new(
        id: SessionId,
        identity: impl Into<String>,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<SocketEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (shutdown, _) = watch::channel(false);

        let session = Arc::new(Self {
            id,
            identity: identity.into(),
            outbound: Mutex::new(Some(tx)),
            state: Mutex::new(SessionState::Connecting),
            shutdown,
            created_at: Instant::now(),
            events_sent: AtomicU64::new(0),
        });

        (session, rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The opaque identity token the connection was opened with.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Move to `next`, returning the previous state.
    pub fn transition(&self, next: SessionState) -> Result<SessionState> {
        let mut state = self.state.lock();
        if !state.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: state.as_str(),
                to: next.as_str(),
            });
        }
        let previous = *state;
        *state = next;
        Ok(previous)
    }

    /// Move `Active -> Closing`. Only the first caller gets `true`.
    pub fn begin_close(&self) -> bool {
        self.transition(SessionState::Closing).is_ok()
    }

    /// Queue an event for the writer without waiting.
    pub fn enqueue(&self, event: SocketEvent) -> Result<()> {
        let outbound = self.outbound.lock();
        let Some(tx) = outbound.as_ref() else {
            return Err(Error::SessionClosed(self.id));
        };

        match tx.try_send(event) {
            Ok(()) => {
                self.events_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(Error::QueueFull(self.id)),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::SessionClosed(self.id)),
        }
    }

    /// Close the outbound queue. Returns `true` only for the call that closed it.
    pub fn close_queue(&self) -> bool {
        self.outbound.lock().take().is_some()
    }

    pub fn is_queue_closed(&self) -> bool {
        self.outbound.lock().is_none()
    }

    /// Tell the reader pump to stop.
    pub(crate) fn signal_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Receiver that flips to `true` once the registry has torn the session down.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Number of events accepted into the outbound queue.
    pub fn events_sent(&self) -> u64 {
        self.events_sent.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("state", &self.state())
            .finish()
    }
}
