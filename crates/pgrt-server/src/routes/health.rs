use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/sessions", get(list_sessions))
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let subscriptions = state.hub.subscriptions();
    Json(json!({
        "status": "healthy",
        "service": "pgrt-server",
        "version": env!("CARGO_PKG_VERSION"),
        "channel": state.config.channel,
        "sessions": {
            "active": state.hub.session_count(),
        },
        "subscriptions": {
            "total": subscriptions.len(),
            "tables": subscriptions.table_count(),
        }
    }))
}

/// Active sessions with their subscribed tables.
async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "sessions": state.hub.sessions() }))
}
