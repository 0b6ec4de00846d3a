//! Table subscriptions held by sessions.
//!
//! One lock guards both indexes, so the router never sees a subscription
//! that exists in one index but not the other.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use crate::hub::SessionId;

/// A session's interest in one table.
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Table being watched.
    pub table: String,
    /// Columns to forward. Empty forwards the whole row.
    pub columns: Vec<String>,
}

impl Subscription {
    pub fn new(table: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            table: table.into(),
            columns,
        }
    }
}

#[derive(Default)]
struct Indexes {
    by_session: HashMap<SessionId, HashMap<String, Subscription>>,
    by_table: HashMap<String, HashSet<SessionId>>,
}

/// Shared subscription index consulted by the change router.
#[derive(Default)]
pub struct SubscriptionTable {
    inner: RwLock<Indexes>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a session to a table.
    ///
    /// Re-subscribing replaces the column filter. Returns `true` if the
    /// subscription is new.
    pub fn subscribe(&self, session_id: SessionId, subscription: Subscription) -> bool {
        let mut inner = self.inner.write();
        let table = subscription.table.clone();

        let previous = inner
            .by_session
            .entry(session_id)
            .or_default()
            .insert(table.clone(), subscription);
        inner.by_table.entry(table.clone()).or_default().insert(session_id);

        tracing::debug!(session_id, table = %table, replaced = previous.is_some(), "subscription added");

        previous.is_none()
    }

    /// Remove one subscription. Returns `false` if there was nothing to remove.
    pub fn unsubscribe(&self, session_id: SessionId, table: &str) -> bool {
        let mut inner = self.inner.write();

        let removed = match inner.by_session.get_mut(&session_id) {
            Some(tables) => {
                let removed = tables.remove(table).is_some();
                if tables.is_empty() {
                    inner.by_session.remove(&session_id);
                }
                removed
            }
            None => false,
        };

        if removed {
            Self::unindex(&mut inner.by_table, table, session_id);
            tracing::debug!(session_id, table, "subscription removed");
        }

        removed
    }

    /// Drop every subscription a session holds. Returns how many were removed.
    pub fn remove_session(&self, session_id: SessionId) -> usize {
        let mut inner = self.inner.write();

        let Some(tables) = inner.by_session.remove(&session_id) else {
            return 0;
        };

        for table in tables.keys() {
            Self::unindex(&mut inner.by_table, table, session_id);
        }

        tables.len()
    }

    fn unindex(by_table: &mut HashMap<String, HashSet<SessionId>>, table: &str, session_id: SessionId) {
        if let Some(ids) = by_table.get_mut(table) {
            ids.remove(&session_id);
            if ids.is_empty() {
                by_table.remove(table);
            }
        }
    }

    /// Sessions subscribed to a table, with their subscription.
    pub fn subscribers(&self, table: &str) -> Vec<(SessionId, Subscription)> {
        let inner = self.inner.read();

        let Some(ids) = inner.by_table.get(table) else {
            return Vec::new();
        };

        ids.iter()
            .filter_map(|id| {
                inner
                    .by_session
                    .get(id)
                    .and_then(|tables| tables.get(table))
                    .map(|sub| (*id, sub.clone()))
            })
            .collect()
    }

    /// Tables a session is subscribed to, sorted.
    pub fn tables_for(&self, session_id: SessionId) -> Vec<String> {
        let inner = self.inner.read();
        let mut tables: Vec<String> = inner
            .by_session
            .get(&session_id)
            .map(|tables| tables.keys().cloned().collect())
            .unwrap_or_default();
        tables.sort();
        tables
    }

    pub fn is_subscribed(&self, session_id: SessionId, table: &str) -> bool {
        self.inner
            .read()
            .by_session
            .get(&session_id)
            .is_some_and(|tables| tables.contains_key(table))
    }

    /// Total number of subscriptions across all sessions.
    pub fn len(&self) -> usize {
        self.inner.read().by_session.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().by_session.is_empty()
    }

    /// Number of distinct tables with at least one subscriber.
    pub fn table_count(&self) -> usize {
        self.inner.read().by_table.len()
    }
}
