//! Restarts the change listener with backoff.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, info, warn};

use super::{ChangeListener, SourceConnector};
use crate::config::ReconnectPolicy;
use crate::error::ListenerError;

/// Owns a [`ChangeListener`] and reconnects it when it fails.
pub struct ListenerSupervisor<C> {
    connector: C,
    listener: ChangeListener,
    policy: ReconnectPolicy,
}

impl<C: SourceConnector> ListenerSupervisor<C> {
    pub fn new(connector: C, listener: ChangeListener, policy: ReconnectPolicy) -> Self {
        Self {
            connector,
            listener,
            policy,
        }
    }

    /// Keep the listener running.
    ///
    /// Returns `Ok(())` once nothing consumes changes any more, or
    /// `RetriesExhausted` after `max_attempts` consecutive failures. A run
    /// only resets the failure count if it was healthy: it forwarded at least
    /// one change or stayed up for `max_backoff`. A source that connects and
    /// then fails straight away keeps backing off.
    pub async fn run(self) -> Result<(), ListenerError> {
        let channel = self.listener.channel().to_string();
        let mut failures: u32 = 0;
        let mut last_backoff = Duration::ZERO;

        loop {
            if self.listener.is_consumer_closed() {
                info!(channel = %channel, "change consumer gone, listener stopping");
                return Ok(());
            }

            match self.connector.connect(&channel).await {
                Ok(mut source) => {
                    info!(channel = %channel, failures, "change listener connected");

                    let started = Instant::now();
                    let forwarded = self.listener.forwarded();

                    match self.listener.run(&mut source).await {
                        ListenerError::ConsumerClosed => {
                            info!(channel = %channel, "change consumer gone, listener stopping");
                            return Ok(());
                        }
                        e => warn!(channel = %channel, error = %e, "change listener stopped"),
                    }

                    if self.listener.forwarded() > forwarded
                        || started.elapsed() >= self.policy.max_backoff
                    {
                        failures = 0;
                    }
                }
                Err(e) => {
                    warn!(channel = %channel, attempt = failures + 1, error = %e, "change listener connect failed");
                }
            }

            failures += 1;
            if !self.policy.allows(failures) {
                error!(channel = %channel, attempts = failures, "change listener giving up");
                return Err(ListenerError::RetriesExhausted {
                    attempts: failures,
                    last_backoff,
                });
            }

            last_backoff = self.policy.backoff(failures);
            info!(channel = %channel, attempt = failures, backoff = ?last_backoff, "reconnecting change listener");
            tokio::time::sleep(last_backoff).await;
        }
    }
}
