//! pgrt server - Postgres change notifications over WebSocket.

use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pgrt_server::{
    create_router,
    listener::{ChangeListener, ListenerSupervisor, PgConnector},
    triggers::TriggerProvisioner,
    AppState, Args, ListenerError,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_filter = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("pgrt_server={},tower_http=info", log_filter).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting pgrt server");

    let config = args.into_config();
    tracing::info!(
        listen = %config.listen_addr,
        channel = %config.channel,
        tables = ?config.tables,
        "configuration loaded"
    );

    let pool = PgPoolOptions::new()
        .max_connections(4)
        .connect(&config.database_url)
        .await?;

    let provisioner =
        TriggerProvisioner::new(pool.clone(), &config.trigger_function, &config.channel)?;
    provisioner
        .provision(config.tables.iter().map(String::as_str))
        .await?;

    let state = AppState::new(config.clone());

    // Listener -> router
    let (changes_tx, changes_rx) = mpsc::channel(config.change_buffer);
    tokio::spawn(state.router.clone().run(changes_rx));

    let supervisor = ListenerSupervisor::new(
        PgConnector::new(pool),
        ChangeListener::new(&config.channel, config.listener_idle, changes_tx),
        config.reconnect,
    );
    let (listener_done_tx, listener_done_rx) = oneshot::channel();
    tokio::spawn(async move {
        let _ = listener_done_tx.send(supervisor.run().await);
    });

    let app = create_router(state);
    let listener = TcpListener::bind(&config.listen_addr).await?;
    tracing::info!(address = %config.listen_addr, "accepting websocket connections at /ws/:token");

    let (outcome_tx, mut outcome_rx) = oneshot::channel::<Result<(), ListenerError>>();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "failed to listen for ctrl+c");
                    }
                    tracing::info!("received shutdown signal");
                    let _ = outcome_tx.send(Ok(()));
                }
                outcome = listener_done_rx => {
                    let outcome = outcome.unwrap_or(Ok(()));
                    if let Err(e) = &outcome {
                        tracing::error!(error = %e, "change listener failed, shutting down");
                    }
                    let _ = outcome_tx.send(outcome);
                }
            }
        })
        .await?;

    tracing::info!("server shutdown complete");

    if let Ok(Err(e)) = outcome_rx.try_recv() {
        return Err(e.into());
    }
    Ok(())
}
