//! Reader and writer tasks for one WebSocket connection.
//!
//! The writer is the only task that writes to the connection. The reader only
//! reads. Either one noticing a transport failure tears the session down
//! through the hub; the registry makes that idempotent.

use std::fmt::Display;
use std::sync::Arc;

use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, timeout, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use pgrt_proto::SocketEvent;

use crate::config::KeepaliveConfig;
use crate::hub::{ClientSession, Hub};
use crate::router::EventRouter;

/// Upper bound on events written per flush.
const MAX_BATCH: usize = 64;

#[derive(Debug)]
enum WriterExit {
    QueueClosed,
    Encode(pgrt_proto::Error),
    Transport(String),
    PingFailed(String),
}

#[derive(Debug)]
enum ReaderExit {
    Shutdown,
    DeadlineExpired,
    PeerClosed,
    Transport(String),
}

/// Drain the session's outbound queue onto the connection.
///
/// Events already waiting when one is dequeued go out in the same flush. A
/// ping is sent whenever `ping_period` passes without a flush. Exits when the
/// queue closes or a write fails, then tears the session down.
pub async fn write_pump<S>(
    session: Arc<ClientSession>,
    hub: Hub,
    mut outbound: mpsc::Receiver<SocketEvent>,
    mut sink: S,
    keepalive: KeepaliveConfig,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut ticker = interval_at(Instant::now() + keepalive.ping_period, keepalive.ping_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let exit = loop {
        tokio::select! {
            next = outbound.recv() => {
                let Some(event) = next else {
                    break WriterExit::QueueClosed;
                };

                match timeout(
                    keepalive.write_timeout,
                    write_batch(&mut sink, event, &mut outbound),
                )
                .await
                {
                    Ok(Ok(written)) => {
                        trace!(session_id = session.id(), written, "flushed");
                        ticker.reset();
                    }
                    Ok(Err(exit)) => break exit,
                    Err(_) => break WriterExit::Transport("write timed out".to_string()),
                }
            }
            _ = ticker.tick() => {
                match timeout(keepalive.write_timeout, sink.send(Message::Ping(Vec::new()))).await {
                    Ok(Ok(())) => trace!(session_id = session.id(), "ping sent"),
                    Ok(Err(e)) => break WriterExit::PingFailed(e.to_string()),
                    Err(_) => break WriterExit::PingFailed("ping timed out".to_string()),
                }
            }
        }
    };

    match &exit {
        WriterExit::QueueClosed | WriterExit::Encode(_) => {
            if let WriterExit::Encode(e) = &exit {
                warn!(session_id = session.id(), error = %e, "failed to encode outbound event");
            }
            // Best effort; the peer may already be gone.
            let _ = timeout(keepalive.write_timeout, sink.send(Message::Close(None))).await;
        }
        WriterExit::Transport(e) | WriterExit::PingFailed(e) => {
            debug!(session_id = session.id(), error = %e, "write failed");
        }
    }

    debug!(session_id = session.id(), reason = ?exit, "writer stopped");
    hub.teardown(&session);
}

async fn write_batch<S>(
    sink: &mut S,
    first: SocketEvent,
    outbound: &mut mpsc::Receiver<SocketEvent>,
) -> Result<usize, WriterExit>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut written = 0;
    let mut next = Some(first);

    while let Some(event) = next.take() {
        let text = event.encode().map_err(WriterExit::Encode)?;
        sink.feed(Message::Text(text))
            .await
            .map_err(|e| WriterExit::Transport(e.to_string()))?;
        written += 1;

        if written < MAX_BATCH {
            next = outbound.try_recv().ok();
        }
    }

    sink.flush()
        .await
        .map_err(|e| WriterExit::Transport(e.to_string()))?;

    Ok(written)
}

/// Read frames from the connection and hand them to the router.
///
/// The read deadline is `pong_wait` from the last pong. Exits on deadline
/// expiry, a read error, a close frame, or once the registry has released
/// the session, then tears the session down.
pub async fn read_pump<S, E>(
    session: Arc<ClientSession>,
    router: EventRouter,
    mut stream: S,
    keepalive: KeepaliveConfig,
) where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let mut shutdown = session.shutdown_signal();
    let mut deadline = Instant::now() + keepalive.pong_wait;

    let exit = loop {
        tokio::select! {
            _ = released(&mut shutdown) => break ReaderExit::Shutdown,
            next = timeout_at(deadline, stream.next()) => {
                let message = match next {
                    Err(_) => break ReaderExit::DeadlineExpired,
                    Ok(None) => break ReaderExit::PeerClosed,
                    Ok(Some(Err(e))) => break ReaderExit::Transport(e.to_string()),
                    Ok(Some(Ok(message))) => message,
                };

                match message {
                    Message::Text(text) => router.handle_frame(&session, &text),
                    Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                        Ok(text) => router.handle_frame(&session, text),
                        Err(e) => {
                            let err = pgrt_proto::Error::MalformedEnvelope(e.to_string());
                            router.reply_error(&session, &err.into());
                        }
                    },
                    Message::Pong(_) => {
                        deadline = Instant::now() + keepalive.pong_wait;
                        trace!(session_id = session.id(), "pong received");
                    }
                    // Pongs for client pings are sent by the socket itself.
                    Message::Ping(_) => {}
                    Message::Close(_) => break ReaderExit::PeerClosed,
                }
            }
        }
    };

    debug!(session_id = session.id(), reason = ?exit, "reader stopped");
    router.hub().teardown(&session);
}

async fn released(signal: &mut watch::Receiver<bool>) {
    while !*signal.borrow_and_update() {
        if signal.changed().await.is_err() {
            return;
        }
    }
}
