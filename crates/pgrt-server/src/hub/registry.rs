//! The session registry and its serialization loop.
//!
//! Every change to the active set goes through [`RegistryActor`], one command
//! at a time, in arrival order. Other tasks only ever take the read lock on
//! the active map, so a broadcast never observes a half-applied
//! registration or removal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use pgrt_proto::SocketEvent;

use super::session::{ClientSession, SessionId, SessionState};
use crate::error::{Error, Result};
use crate::subscription::SubscriptionTable;

/// Outcome of a fan-out.
#[derive(Debug, Default)]
struct Delivery {
    delivered: usize,
    /// Sessions whose queue was full or closed.
    dropped: Vec<SessionId>,
}

/// The active set plus the subscription index it keeps in sync.
struct Registry {
    sessions: RwLock<HashMap<SessionId, Arc<ClientSession>>>,
    subscriptions: Arc<SubscriptionTable>,
}

impl Registry {
    fn broadcast(&self, event: &SocketEvent) -> Delivery {
        let sessions = self.sessions.read();
        let mut delivery = Delivery::default();

        for session in sessions.values() {
            match session.enqueue(event.clone()) {
                Ok(()) => delivery.delivered += 1,
                Err(e) => {
                    warn!(session_id = session.id(), error = %e, "dropping session during broadcast");
                    delivery.dropped.push(session.id());
                }
            }
        }

        delivery
    }

    fn get(&self, id: SessionId) -> Option<Arc<ClientSession>> {
        self.sessions.read().get(&id).cloned()
    }
}

enum Command {
    Register {
        session: Arc<ClientSession>,
        ack: oneshot::Sender<Result<()>>,
    },
    Deregister {
        id: SessionId,
        ack: Option<oneshot::Sender<bool>>,
    },
}

/// Single owner of all registry mutation.
struct RegistryActor {
    registry: Arc<Registry>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl RegistryActor {
    async fn run(mut self) {
        debug!("session registry started");

        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Register { session, ack } => {
                    let result = self.register(session);
                    let _ = ack.send(result);
                }
                Command::Deregister { id, ack } => {
                    let removed = self.deregister(id);
                    if let Some(ack) = ack {
                        let _ = ack.send(removed);
                    }
                }
            }
        }

        // Every hub handle is gone; release whatever is left.
        let remaining: Vec<Arc<ClientSession>> = {
            let mut sessions = self.registry.sessions.write();
            sessions.drain().map(|(_, session)| session).collect()
        };
        for session in &remaining {
            self.release(session);
        }

        debug!(released = remaining.len(), "session registry stopped");
    }

    fn register(&self, session: Arc<ClientSession>) -> Result<()> {
        {
            let mut sessions = self.registry.sessions.write();
            session.transition(SessionState::Active)?;
            sessions.insert(session.id(), session.clone());
        }

        info!(
            session_id = session.id(),
            identity = session.identity(),
            "session registered"
        );

        self.announce(SocketEvent::connect(Some(session.identity())));
        Ok(())
    }

    fn deregister(&self, id: SessionId) -> bool {
        let Some(session) = self.registry.sessions.write().remove(&id) else {
            debug!(session_id = id, "deregister for unknown session ignored");
            return false;
        };

        self.release(&session);
        info!(
            session_id = id,
            identity = session.identity(),
            age = ?session.age(),
            "session deregistered"
        );

        self.announce(SocketEvent::disconnect(Some(session.identity())));
        true
    }

    /// `Active -> Closing -> Closed`: close the queue, stop the reader, drop
    /// subscriptions. Runs once per session because only the actor removes
    /// sessions from the map.
    fn release(&self, session: &ClientSession) {
        session.begin_close();
        session.close_queue();
        session.signal_shutdown();
        if let Err(e) = session.transition(SessionState::Closed) {
            warn!(session_id = session.id(), error = %e, "unexpected session state on release");
        }

        let removed = self.registry.subscriptions.remove_session(session.id());
        if removed > 0 {
            debug!(session_id = session.id(), removed, "subscriptions dropped with session");
        }
    }

    /// Broadcast a presence event, removing any session that cannot take it.
    fn announce(&self, event: SocketEvent) {
        let mut pending = self.registry.broadcast(&event).dropped;

        while let Some(id) = pending.pop() {
            let Some(session) = self.registry.sessions.write().remove(&id) else {
                continue;
            };
            self.release(&session);
            info!(session_id = id, "slow session deregistered");

            let leaving = SocketEvent::disconnect(Some(session.identity()));
            pending.extend(self.registry.broadcast(&leaving).dropped);
        }
    }
}

/// Snapshot of one active session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub identity: String,
    pub state: &'static str,
    pub age_secs: u64,
    pub events_sent: u64,
    pub tables: Vec<String>,
}

/// Shorten a session token for listings: the first three characters, then
/// `***`. Tokens of four characters or fewer are hidden entirely.
fn mask_identity(identity: &str) -> String {
    if identity.chars().count() <= 4 {
        return "****".to_string();
    }
    let prefix: String = identity.chars().take(3).collect();
    format!("{prefix}***")
}

/// Handle to a session registry.
///
/// Cheap to clone; every clone talks to the same registry loop. The loop
/// stops once the last handle is dropped.
#[derive(Clone)]
pub struct Hub {
    registry: Arc<Registry>,
    commands: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
    outbound_capacity: usize,
}

impl Hub {
    /// Start a registry loop on the current runtime.
    pub fn start(subscriptions: Arc<SubscriptionTable>, outbound_capacity: usize) -> Self {
        let registry = Arc::new(Registry {
            sessions: RwLock::new(HashMap::new()),
            subscriptions,
        });
        let (tx, rx) = mpsc::unbounded_channel();

        let actor = RegistryActor {
            registry: registry.clone(),
            commands: rx,
        };
        tokio::spawn(actor.run());

        Self {
            registry,
            commands: tx,
            next_id: Arc::new(AtomicU64::new(1)),
            outbound_capacity: outbound_capacity.max(1),
        }
    }

    /// Allocate a session for a freshly accepted connection.
    pub fn open_session(
        &self,
        identity: impl Into<String>,
    ) -> (Arc<ClientSession>, mpsc::Receiver<SocketEvent>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        ClientSession::new(id, identity, self.outbound_capacity)
    }

    /// Add a session to the active set and announce it.
    pub async fn register(&self, session: Arc<ClientSession>) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(Command::Register { session, ack })
            .map_err(|_| Error::HubClosed)?;
        done.await.map_err(|_| Error::HubClosed)?
    }

    /// Remove a session and wait for the registry to process it.
    ///
    /// Returns `false` if the session was not active.
    pub async fn deregister(&self, id: SessionId) -> Result<bool> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(Command::Deregister { id, ack: Some(ack) })
            .map_err(|_| Error::HubClosed)?;
        done.await.map_err(|_| Error::HubClosed)
    }

    /// Queue a removal without waiting. Safe to call from any task, any
    /// number of times.
    pub fn request_deregister(&self, id: SessionId) {
        if self
            .commands
            .send(Command::Deregister { id, ack: None })
            .is_err()
        {
            debug!(session_id = id, "registry gone, deregister dropped");
        }
    }

    /// Start tearing a session down. Only the first caller moves the session
    /// to `Closing` and queues the removal; later calls do nothing.
    pub fn teardown(&self, session: &ClientSession) {
        if session.begin_close() {
            debug!(session_id = session.id(), "session closing");
            self.request_deregister(session.id());
        }
    }

    /// Queue an event on every active session. Returns how many accepted it.
    pub fn broadcast(&self, event: SocketEvent) -> Result<usize> {
        if !event.has_payload() {
            return Err(Error::EmptyPayload);
        }

        let delivery = self.registry.broadcast(&event);
        for id in delivery.dropped {
            self.request_deregister(id);
        }

        Ok(delivery.delivered)
    }

    /// Queue an event on one session.
    ///
    /// A full queue means the client is not keeping up; the session is torn
    /// down and the error returned.
    pub fn emit_to(&self, id: SessionId, event: SocketEvent) -> Result<()> {
        if !event.has_payload() {
            return Err(Error::EmptyPayload);
        }

        let session = self.registry.get(id).ok_or(Error::SessionNotFound(id))?;
        match session.enqueue(event) {
            Err(Error::QueueFull(id)) => {
                warn!(session_id = id, "outbound queue full, closing session");
                self.teardown(&session);
                Err(Error::QueueFull(id))
            }
            other => other,
        }
    }

    /// Look up an active session.
    pub fn get(&self, id: SessionId) -> Option<Arc<ClientSession>> {
        self.registry.get(id)
    }

    pub fn is_active(&self, id: SessionId) -> bool {
        self.registry.sessions.read().contains_key(&id)
    }

    pub fn session_count(&self) -> usize {
        self.registry.sessions.read().len()
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionTable> {
        &self.registry.subscriptions
    }

    /// Snapshot of all active sessions, ordered by id.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .registry
            .sessions
            .read()
            .values()
            .map(|session| SessionInfo {
                id: session.id(),
                identity: mask_identity(session.identity()),
                state: session.state().as_str(),
                age_secs: session.age().as_secs(),
                events_sent: session.events_sent(),
                tables: self.registry.subscriptions.tables_for(session.id()),
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::Subscription;
    use pgrt_proto::{ConnectionPayload, EventType};
    use serde_json::Value;

    fn hub() -> Hub {
        Hub::start(Arc::new(SubscriptionTable::new()), 16)
    }

    fn drain(rx: &mut mpsc::Receiver<SocketEvent>) -> Vec<SocketEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn user_of(event: &SocketEvent) -> Option<String> {
        event.payload_as::<ConnectionPayload>().unwrap().user_id
    }

    #[tokio::test]
    async fn test_register_announces_to_active_sessions() {
        let hub = hub();

        let (alice, mut alice_rx) = hub.open_session("alice");
        hub.register(alice.clone()).await.unwrap();
        assert_eq!(alice.state(), SessionState::Active);

        let (bob, mut bob_rx) = hub.open_session("bob");
        hub.register(bob.clone()).await.unwrap();

        let alice_events = drain(&mut alice_rx);
        assert_eq!(alice_events.len(), 2);
        assert_eq!(user_of(&alice_events[0]).as_deref(), Some("alice"));
        assert_eq!(user_of(&alice_events[1]).as_deref(), Some("bob"));

        // Bob only sees his own arrival, not Alice's earlier one.
        let bob_events = drain(&mut bob_rx);
        assert_eq!(bob_events.len(), 1);
        assert_eq!(bob_events[0].payload_type, EventType::Connect);
        assert_eq!(user_of(&bob_events[0]).as_deref(), Some("bob"));

        assert_eq!(hub.session_count(), 2);
    }

    #[tokio::test]
    async fn test_deregister_announces_and_closes() {
        let hub = hub();
        let (alice, mut alice_rx) = hub.open_session("alice");
        let (bob, mut bob_rx) = hub.open_session("bob");
        hub.register(alice.clone()).await.unwrap();
        hub.register(bob.clone()).await.unwrap();
        drain(&mut alice_rx);

        assert!(hub.deregister(bob.id()).await.unwrap());

        assert_eq!(bob.state(), SessionState::Closed);
        assert!(bob.is_queue_closed());
        assert!(!hub.is_active(bob.id()));

        let alice_events = drain(&mut alice_rx);
        assert_eq!(alice_events.len(), 1);
        assert_eq!(alice_events[0].payload_type, EventType::Disconnect);
        assert_eq!(user_of(&alice_events[0]).as_deref(), Some("bob"));

        // Bob's queue drains what was already queued, then reports closed.
        let mut seen = 0;
        while bob_rx.recv().await.is_some() {
            seen += 1;
        }
        assert_eq!(seen, 1);
    }

    #[tokio::test]
    async fn test_deregister_twice_is_noop() {
        let hub = hub();
        let (alice, _alice_rx) = hub.open_session("alice");
        let (bob, mut bob_rx) = hub.open_session("bob");
        hub.register(alice.clone()).await.unwrap();
        hub.register(bob.clone()).await.unwrap();
        drain(&mut bob_rx);

        assert!(hub.deregister(alice.id()).await.unwrap());
        assert!(!hub.deregister(alice.id()).await.unwrap());

        // Exactly one disconnect announcement.
        let bob_events = drain(&mut bob_rx);
        assert_eq!(bob_events.len(), 1);
        assert_eq!(alice.state(), SessionState::Closed);
        assert_eq!(hub.session_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_teardown_deregisters_once() {
        let hub = hub();
        let (alice, _alice_rx) = hub.open_session("alice");
        let (bob, mut bob_rx) = hub.open_session("bob");
        hub.register(alice.clone()).await.unwrap();
        hub.register(bob.clone()).await.unwrap();
        drain(&mut bob_rx);

        // Reader and writer both notice the failure.
        let mut tasks = Vec::new();
        for _ in 0..2 {
            let hub = hub.clone();
            let alice = alice.clone();
            tasks.push(tokio::spawn(async move { hub.teardown(&alice) }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        hub.request_deregister(alice.id());

        // Round-trip through the registry so every queued command has run.
        assert!(!hub.deregister(alice.id()).await.unwrap());

        assert_eq!(alice.state(), SessionState::Closed);
        assert_eq!(drain(&mut bob_rx).len(), 1);
        assert_eq!(hub.session_count(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_rejects_empty_payload() {
        let hub = hub();
        let (alice, mut rx) = hub.open_session("alice");
        hub.register(alice.clone()).await.unwrap();
        drain(&mut rx);

        let err = hub
            .broadcast(SocketEvent::new(EventType::Connect, Value::Null))
            .unwrap_err();
        assert!(matches!(err, Error::EmptyPayload));

        let err = hub
            .emit_to(alice.id(), SocketEvent::new(EventType::Connect, serde_json::json!({})))
            .unwrap_err();
        assert!(matches!(err, Error::EmptyPayload));

        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_emit_to_targets_one_session() {
        let hub = hub();
        let (alice, mut alice_rx) = hub.open_session("alice");
        let (bob, mut bob_rx) = hub.open_session("bob");
        hub.register(alice.clone()).await.unwrap();
        hub.register(bob.clone()).await.unwrap();
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        hub.emit_to(bob.id(), SocketEvent::message("hi bob")).unwrap();

        assert!(drain(&mut alice_rx).is_empty());
        assert_eq!(drain(&mut bob_rx), vec![SocketEvent::message("hi bob")]);

        let err = hub.emit_to(999, SocketEvent::message("nobody")).unwrap_err();
        assert!(matches!(err, Error::SessionNotFound(999)));
    }

    #[tokio::test]
    async fn test_slow_session_is_dropped() {
        let hub = Hub::start(Arc::new(SubscriptionTable::new()), 1);
        let (slow, _slow_rx) = hub.open_session("slow");
        hub.register(slow.clone()).await.unwrap();

        // The connect announcement already fills the single slot.
        let err = hub.emit_to(slow.id(), SocketEvent::message("more")).unwrap_err();
        assert!(matches!(err, Error::QueueFull(_)));

        assert!(!hub.deregister(slow.id()).await.unwrap());
        assert_eq!(slow.state(), SessionState::Closed);
        assert_eq!(hub.session_count(), 0);
    }

    #[tokio::test]
    async fn test_deregister_drops_subscriptions() {
        let hub = hub();
        let (alice, _rx) = hub.open_session("alice");
        hub.register(alice.clone()).await.unwrap();
        hub.subscriptions()
            .subscribe(alice.id(), Subscription::new("users", Vec::new()));

        assert_eq!(hub.sessions()[0].tables, vec!["users"]);

        hub.deregister(alice.id()).await.unwrap();
        assert!(hub.subscriptions().is_empty());
        assert!(hub.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_register_twice_fails() {
        let hub = hub();
        let (alice, _rx) = hub.open_session("alice");
        hub.register(alice.clone()).await.unwrap();

        let err = hub.register(alice.clone()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(hub.session_count(), 1);
    }

    #[tokio::test]
    async fn test_session_listing_masks_identity() {
        let hub = hub();
        let (alice, _a) = hub.open_session("alice-secret-token");
        let (bob, _b) = hub.open_session("bob");
        hub.register(alice.clone()).await.unwrap();
        hub.register(bob.clone()).await.unwrap();

        let identities: Vec<String> = hub.sessions().into_iter().map(|info| info.identity).collect();
        assert_eq!(identities, vec!["ali***", "****"]);
        assert_eq!(alice.identity(), "alice-secret-token");
    }

    #[test]
    fn test_mask_identity() {
        assert_eq!(mask_identity(""), "****");
        assert_eq!(mask_identity("abcd"), "****");
        assert_eq!(mask_identity("abcde"), "abc***");
        assert_eq!(mask_identity("ünïcödé"), "ünï***");
    }
}
