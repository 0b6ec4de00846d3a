//! pgrt server library.
//!
//! Streams Postgres row changes to WebSocket clients:
//! - A notify trigger publishes each change on a channel ([`triggers`])
//! - A supervised listener decodes them ([`listener`])
//! - The router fans them out to subscribed sessions ([`router`])
//! - Each session runs a reader and a writer over its socket ([`ws`])

pub mod config;
pub mod error;
pub mod hub;
pub mod listener;
pub mod router;
pub mod routes;
pub mod state;
pub mod subscription;
pub mod triggers;
pub mod ws;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

pub use config::{Args, KeepaliveConfig, ReconnectPolicy, ServerConfig};
pub use error::{Error, ListenerError};
pub use hub::{ClientSession, Hub, SessionId, SessionState};
pub use router::EventRouter;
pub use state::AppState;
pub use subscription::{Subscription, SubscriptionTable};

/// Create the Axum router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(routes::health::routes())
        .route("/ws/:token", get(ws::ws_connect))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
