//! Routing of inbound socket events and database changes.
//!
//! Client frames arrive through [`EventRouter::handle_frame`] from each
//! session's reader. Row changes arrive through [`EventRouter::run`], one
//! loop per change source, and fan out only to sessions subscribed to the
//! changed table.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use pgrt_proto::{ChangeEvent, EventType, SocketEvent, SubscribePayload, UnsubscribePayload};

use crate::error::{Error, Result};
use crate::hub::{ClientSession, Hub};
use crate::subscription::{Subscription, SubscriptionTable};

/// Names used in "table name required for ..." replies. Subscribe says
/// `subscription` rather than `subscribe`; clients already match on it.
const SUBSCRIBE_ERROR_NAME: &str = "subscription";
const UNSUBSCRIBE_ERROR_NAME: &str = "unsubscribe";

/// Dispatches socket events and change events to sessions.
#[derive(Clone)]
pub struct EventRouter {
    hub: Hub,
}

impl EventRouter {
    pub fn new(hub: Hub) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    fn subscriptions(&self) -> &Arc<SubscriptionTable> {
        self.hub.subscriptions()
    }

    /// Decode and route one text frame from a client.
    ///
    /// Failures are answered with an `error` event to the sender; the session
    /// stays open.
    pub fn handle_frame(&self, session: &ClientSession, text: &str) {
        let result = SocketEvent::decode(text)
            .map_err(Error::from)
            .and_then(|event| self.route(session, event));

        if let Err(e) = result {
            debug!(session_id = session.id(), error = %e, "rejected client frame");
            self.reply_error(session, &e);
        }
    }

    /// Route a decoded client event.
    pub fn route(&self, session: &ClientSession, event: SocketEvent) -> Result<()> {
        trace!(session_id = session.id(), payload_type = %event.payload_type, "routing event");

        match event.payload_type {
            EventType::Connect | EventType::Disconnect => {
                self.hub.broadcast(event)?;
                Ok(())
            }
            EventType::Subscribe => self.subscribe(session, &event),
            EventType::Unsubscribe => self.unsubscribe(session, &event),
            EventType::SubscriptionResponse | EventType::Error => Err(
                pgrt_proto::Error::UnexpectedEventType(event.payload_type.to_string()).into(),
            ),
            EventType::Unknown => Err(pgrt_proto::Error::UnknownEventType.into()),
        }
    }

    fn subscribe(&self, session: &ClientSession, event: &SocketEvent) -> Result<()> {
        let missing = pgrt_proto::Error::MissingField {
            event_type: SUBSCRIBE_ERROR_NAME,
            field: "table name",
        };
        if !event.has_payload() {
            return Err(missing.into());
        }

        let payload: SubscribePayload = event.payload_as()?;
        let table = match payload.table_name {
            Some(table) if !table.is_empty() => table,
            _ => return Err(missing.into()),
        };

        self.subscriptions()
            .subscribe(session.id(), Subscription::new(table.clone(), payload.columns));

        // Lost a race with deregistration: do not leave an orphan behind.
        if !self.hub.is_active(session.id()) {
            self.subscriptions().unsubscribe(session.id(), &table);
            return Err(Error::SessionClosed(session.id()));
        }

        info!(session_id = session.id(), table = %table, "table subscribed");

        self.hub.emit_to(
            session.id(),
            SocketEvent::message(format!("You successfully subscribed to table {table}")),
        )
    }

    fn unsubscribe(&self, session: &ClientSession, event: &SocketEvent) -> Result<()> {
        let missing = pgrt_proto::Error::MissingField {
            event_type: UNSUBSCRIBE_ERROR_NAME,
            field: "table name",
        };
        if !event.has_payload() {
            return Err(missing.into());
        }

        let payload: UnsubscribePayload = event.payload_as()?;
        let table = match payload.table_name {
            Some(table) if !table.is_empty() => table,
            _ => return Err(missing.into()),
        };

        let removed = self.subscriptions().unsubscribe(session.id(), &table);
        info!(session_id = session.id(), table = %table, removed, "table unsubscribed");

        self.hub.emit_to(
            session.id(),
            SocketEvent::message(format!("You successfully unsubscribed from table {table}")),
        )
    }

    /// Send an `error` event to one session.
    pub fn reply_error(&self, session: &ClientSession, error: &Error) {
        let message = match error {
            Error::Protocol(e) => e.to_string(),
            other => other.to_string(),
        };

        if let Err(e) = self.hub.emit_to(session.id(), SocketEvent::error(message)) {
            debug!(session_id = session.id(), error = %e, "could not deliver error reply");
        }
    }

    /// Deliver a change to every session subscribed to its table.
    ///
    /// Returns the number of sessions that accepted it.
    pub fn dispatch_change(&self, change: &ChangeEvent) -> usize {
        let subscribers = self.subscriptions().subscribers(&change.table);
        if subscribers.is_empty() {
            trace!(table = %change.table, "change has no subscribers");
            return 0;
        }

        let full_row = SocketEvent::change(change);
        let mut delivered = 0;

        for (session_id, subscription) in subscribers {
            let event = if subscription.columns.is_empty() {
                full_row.clone()
            } else {
                SocketEvent::change(&change.project(&subscription.columns))
            };

            match self.hub.emit_to(session_id, event) {
                Ok(()) => delivered += 1,
                Err(Error::SessionNotFound(_)) => {
                    trace!(session_id, "subscriber left before delivery");
                }
                Err(e) => {
                    debug!(session_id, table = %change.table, error = %e, "change not delivered");
                }
            }
        }

        debug!(
            table = %change.table,
            action = %change.action,
            delivered,
            "change dispatched"
        );

        delivered
    }

    /// Drain a change source until it closes.
    pub async fn run(self, mut changes: mpsc::Receiver<ChangeEvent>) {
        info!("change router started");

        while let Some(change) = changes.recv().await {
            self.dispatch_change(&change);
        }

        warn!("change source closed, router stopping");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgrt_proto::{ChangeAction, MessagePayload};
    use serde_json::{json, Map, Value};

    async fn setup(names: &[&str]) -> (EventRouter, Vec<(Arc<ClientSession>, mpsc::Receiver<SocketEvent>)>) {
        let hub = Hub::start(Arc::new(SubscriptionTable::new()), 32);
        let mut sessions = Vec::new();
        for name in names {
            let (session, rx) = hub.open_session(*name);
            hub.register(session.clone()).await.unwrap();
            sessions.push((session, rx));
        }
        for (_, rx) in sessions.iter_mut() {
            drain(rx);
        }
        (EventRouter::new(hub), sessions)
    }

    fn drain(rx: &mut mpsc::Receiver<SocketEvent>) -> Vec<SocketEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn change(table: &str) -> ChangeEvent {
        let data: Map<String, Value> = json!({"id": 1, "name": "a", "email": "a@example.com"})
            .as_object()
            .cloned()
            .unwrap();
        ChangeEvent::new(table, ChangeAction::Update, data)
    }

    fn message_of(event: &SocketEvent) -> String {
        event.payload_as::<MessagePayload>().unwrap().message
    }

    fn subscribe_frame(table: &str) -> String {
        SocketEvent::subscribe(table, &[]).encode().unwrap()
    }

    #[tokio::test]
    async fn test_subscribe_confirms_to_sender_only() {
        let (router, mut sessions) = setup(&["alice", "bob"]).await;
        let (alice, _) = &sessions[0];
        let alice = alice.clone();

        router.handle_frame(&alice, &subscribe_frame("users"));

        let replies = drain(&mut sessions[0].1);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].payload_type, EventType::SubscriptionResponse);
        assert_eq!(message_of(&replies[0]), "You successfully subscribed to table users");
        assert!(drain(&mut sessions[1].1).is_empty());

        assert!(router.hub().subscriptions().is_subscribed(alice.id(), "users"));
    }

    #[tokio::test]
    async fn test_change_reaches_only_subscribers() {
        let (router, mut sessions) = setup(&["alice", "bob"]).await;
        let alice = sessions[0].0.clone();
        router.handle_frame(&alice, &subscribe_frame("users"));
        drain(&mut sessions[0].1);

        assert_eq!(router.dispatch_change(&change("users")), 1);
        assert_eq!(router.dispatch_change(&change("posts")), 0);

        let received = drain(&mut sessions[0].1);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].change_payload(), Some(change("users")));

        assert!(drain(&mut sessions[1].1).is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery_for_that_session() {
        let (router, mut sessions) = setup(&["alice", "bob"]).await;
        let alice = sessions[0].0.clone();
        let bob = sessions[1].0.clone();
        router.handle_frame(&alice, &subscribe_frame("users"));
        router.handle_frame(&bob, &subscribe_frame("users"));

        router.handle_frame(&alice, &SocketEvent::unsubscribe("users").encode().unwrap());
        let alice_events = drain(&mut sessions[0].1);
        assert_eq!(
            message_of(alice_events.last().unwrap()),
            "You successfully unsubscribed from table users"
        );
        drain(&mut sessions[1].1);

        assert_eq!(router.dispatch_change(&change("users")), 1);
        assert!(drain(&mut sessions[0].1).is_empty());
        assert_eq!(drain(&mut sessions[1].1).len(), 1);

        // Unsubscribing again is harmless.
        router.handle_frame(&alice, &SocketEvent::unsubscribe("users").encode().unwrap());
        assert_eq!(drain(&mut sessions[0].1).len(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_without_table_errors_to_sender() {
        let (router, mut sessions) = setup(&["alice", "bob"]).await;
        let alice = sessions[0].0.clone();

        let frames = [
            r#"{"payload_type":"subscribe","payload":null}"#,
            r#"{"payload_type":"subscribe"}"#,
            r#"{"payload_type":"subscribe","payload":{"columns":["id"]}}"#,
            r#"{"payload_type":"subscribe","payload":{"table_name":""}}"#,
        ];
        for frame in frames {
            router.handle_frame(&alice, frame);
            let replies = drain(&mut sessions[0].1);
            assert_eq!(replies.len(), 1, "frame {frame}");
            assert_eq!(replies[0].payload_type, EventType::Error);
            assert_eq!(message_of(&replies[0]), "table name required for subscription payload");
        }

        assert!(drain(&mut sessions[1].1).is_empty());
        assert!(router.hub().is_active(alice.id()));
        assert!(router.hub().subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_without_table_errors_to_sender() {
        let (router, mut sessions) = setup(&["alice", "bob"]).await;
        let alice = sessions[0].0.clone();

        for frame in [
            r#"{"payload_type":"unsubscribe","payload":null}"#,
            r#"{"payload_type":"unsubscribe","payload":{"table_name":""}}"#,
        ] {
            router.handle_frame(&alice, frame);
            let replies = drain(&mut sessions[0].1);
            assert_eq!(replies.len(), 1, "frame {frame}");
            assert_eq!(replies[0].payload_type, EventType::Error);
            assert_eq!(message_of(&replies[0]), "table name required for unsubscribe payload");
        }

        assert!(drain(&mut sessions[1].1).is_empty());
        assert!(router.hub().is_active(alice.id()));
    }

    #[tokio::test]
    async fn test_protocol_errors_keep_session() {
        let (router, mut sessions) = setup(&["alice"]).await;
        let alice = sessions[0].0.clone();

        router.handle_frame(&alice, "not json");
        router.handle_frame(&alice, r#"{"payload_type":"shout","payload":{}}"#);
        router.handle_frame(&alice, r#"{"payload_type":"subscription:response","payload":{"message":"x"}}"#);
        router.handle_frame(&alice, r#"{"payload_type":"subscribe","payload":{"table_name":7}}"#);

        let replies = drain(&mut sessions[0].1);
        assert_eq!(replies.len(), 4);
        assert!(replies.iter().all(|e| e.payload_type == EventType::Error));
        assert_eq!(
            message_of(&replies[1]),
            "invalid payload detected: unknown payload type"
        );
        assert!(router.hub().is_active(alice.id()));
    }

    #[tokio::test]
    async fn test_client_presence_event_is_broadcast() {
        let (router, mut sessions) = setup(&["alice", "bob"]).await;
        let alice = sessions[0].0.clone();

        router.handle_frame(&alice, &SocketEvent::connect(Some("alice")).encode().unwrap());
        assert_eq!(drain(&mut sessions[0].1).len(), 1);
        assert_eq!(drain(&mut sessions[1].1).len(), 1);

        // Empty presence payloads are refused, not broadcast.
        router.handle_frame(&alice, r#"{"payload_type":"disconnect","payload":{}}"#);
        let replies = drain(&mut sessions[0].1);
        assert_eq!(replies[0].payload_type, EventType::Error);
        assert!(drain(&mut sessions[1].1).is_empty());
    }

    #[tokio::test]
    async fn test_column_filter_projects_row() {
        let (router, mut sessions) = setup(&["alice", "bob"]).await;
        let alice = sessions[0].0.clone();
        let bob = sessions[1].0.clone();

        router.handle_frame(&alice, &SocketEvent::subscribe("users", &["id", "name"]).encode().unwrap());
        router.handle_frame(&bob, &subscribe_frame("users"));
        drain(&mut sessions[0].1);
        drain(&mut sessions[1].1);

        assert_eq!(router.dispatch_change(&change("users")), 2);

        let projected = drain(&mut sessions[0].1)[0].change_payload().unwrap();
        assert_eq!(projected.data.len(), 2);
        assert!(!projected.data.contains_key("email"));

        let full = drain(&mut sessions[1].1)[0].change_payload().unwrap();
        assert_eq!(full, change("users"));
    }

    #[tokio::test]
    async fn test_subscribe_after_deregister_leaves_nothing() {
        let (router, _sessions) = setup(&["alice"]).await;
        let (late, _rx) = router.hub().open_session("late");

        // Never registered, so the subscription is rolled back.
        let err = router.route(&late, SocketEvent::subscribe("users", &[])).unwrap_err();
        assert!(matches!(err, Error::SessionClosed(_)));
        assert!(router.hub().subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_run_drains_channel() {
        let (router, mut sessions) = setup(&["alice"]).await;
        let alice = sessions[0].0.clone();
        router.handle_frame(&alice, &subscribe_frame("users"));
        drain(&mut sessions[0].1);

        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(router.clone().run(rx));

        tx.send(change("users")).await.unwrap();
        tx.send(change("posts")).await.unwrap();
        tx.send(change("users")).await.unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(drain(&mut sessions[0].1).len(), 2);
    }
}
