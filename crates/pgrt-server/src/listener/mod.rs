//! Change listener.
//!
//! A [`ChangeListener`] pulls raw notify payloads from a
//! [`NotificationSource`], decodes them into [`ChangeEvent`]s and hands them
//! to the router over a bounded channel. Any failure ends the run; the
//! [`ListenerSupervisor`] decides whether to reconnect.

mod postgres;
mod supervisor;

pub use postgres::{PgConnector, PgNotificationSource};
pub use supervisor::ListenerSupervisor;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, trace};

use pgrt_proto::ChangeEvent;

use crate::error::ListenerError;

/// A connection subscribed to one notify channel.
#[async_trait]
pub trait NotificationSource: Send {
    /// Wait for the next notification payload.
    async fn recv(&mut self) -> Result<String, ListenerError>;

    /// Check that the underlying connection is still usable.
    async fn ping(&mut self) -> Result<(), ListenerError>;
}

/// Opens notification sources, once per (re)connect.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    type Source: NotificationSource;

    async fn connect(&self, channel: &str) -> Result<Self::Source, ListenerError>;
}

/// Forwards decoded changes from one channel.
pub struct ChangeListener {
    channel: String,
    idle: Duration,
    changes: mpsc::Sender<ChangeEvent>,
    forwarded: AtomicU64,
}

impl ChangeListener {
    pub fn new(channel: impl Into<String>, idle: Duration, changes: mpsc::Sender<ChangeEvent>) -> Self {
        Self {
            channel: channel.into(),
            idle,
            changes,
            forwarded: AtomicU64::new(0),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Changes handed to the router so far, across all runs.
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Whether the router side has gone away.
    pub fn is_consumer_closed(&self) -> bool {
        self.changes.is_closed()
    }

    /// Forward changes until something fails, and return what failed.
    ///
    /// After `idle` without a notification the source is probed.
    pub async fn run<S: NotificationSource + ?Sized>(&self, source: &mut S) -> ListenerError {
        loop {
            let payload = match timeout(self.idle, source.recv()).await {
                Ok(Ok(payload)) => payload,
                Ok(Err(e)) => return e,
                Err(_) => {
                    debug!(channel = %self.channel, idle = ?self.idle, "no notifications, probing connection");
                    if let Err(e) = source.ping().await {
                        return e;
                    }
                    continue;
                }
            };

            let change = match ChangeEvent::from_notification(&payload) {
                Ok(change) => change,
                Err(e) => return e.into(),
            };

            trace!(
                channel = %self.channel,
                table = %change.table,
                action = %change.action,
                "change received"
            );

            if self.changes.send(change).await.is_err() {
                return ListenerError::ConsumerClosed;
            }
            self.forwarded.fetch_add(1, Ordering::Relaxed);
        }
    }
}
