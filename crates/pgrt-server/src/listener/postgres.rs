//! Postgres `LISTEN` source.

use async_trait::async_trait;
use sqlx::postgres::{PgListener, PgPool};
use tracing::debug;

use super::{NotificationSource, SourceConnector};
use crate::error::ListenerError;

/// A `PgListener` subscribed to one channel.
pub struct PgNotificationSource {
    listener: PgListener,
}

#[async_trait]
impl NotificationSource for PgNotificationSource {
    async fn recv(&mut self) -> Result<String, ListenerError> {
        let notification = self.listener.recv().await.map_err(ListenerError::Receive)?;
        Ok(notification.payload().to_string())
    }

    async fn ping(&mut self) -> Result<(), ListenerError> {
        sqlx::query("SELECT 1")
            .execute(&mut self.listener)
            .await
            .map_err(ListenerError::Probe)?;
        Ok(())
    }
}

/// Opens listener connections from a pool's connect options.
#[derive(Clone)]
pub struct PgConnector {
    pool: PgPool,
}

impl PgConnector {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SourceConnector for PgConnector {
    type Source = PgNotificationSource;

    async fn connect(&self, channel: &str) -> Result<PgNotificationSource, ListenerError> {
        let connect_error = |source| ListenerError::Connect {
            channel: channel.to_string(),
            source,
        };

        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(connect_error)?;
        listener.listen(channel).await.map_err(connect_error)?;

        debug!(channel, "listening on notify channel");
        Ok(PgNotificationSource { listener })
    }
}
