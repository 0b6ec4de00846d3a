//! WebSocket endpoint.

mod pump;

pub use pump::{read_pump, write_pump};

use axum::{
    extract::{ws::WebSocket, Path, State, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use tracing::{debug, warn};

use crate::state::AppState;

/// WebSocket upgrade handler for `/ws/:token`.
///
/// The path token becomes the session identity.
pub async fn ws_connect(
    ws: WebSocketUpgrade,
    Path(token): Path<String>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    if !state.config.origin_allowed(origin) {
        warn!(origin = ?origin, "websocket origin rejected");
        return StatusCode::FORBIDDEN.into_response();
    }

    ws.max_message_size(state.config.keepalive.max_message_size)
        .on_upgrade(move |socket| serve_socket(socket, token, state))
}

/// Run one connection until both pumps have stopped.
async fn serve_socket(socket: WebSocket, identity: String, state: AppState) {
    let hub = state.hub.clone();
    let keepalive = state.config.keepalive;

    let (session, outbound) = hub.open_session(identity);
    let (sink, stream) = socket.split();

    let writer = tokio::spawn(write_pump(
        session.clone(),
        hub.clone(),
        outbound,
        sink,
        keepalive,
    ));

    if let Err(e) = hub.register(session.clone()).await {
        warn!(session_id = session.id(), error = %e, "failed to register session");
        session.close_queue();
        let _ = writer.await;
        return;
    }

    read_pump(session.clone(), state.router.clone(), stream, keepalive).await;

    if let Err(e) = writer.await {
        warn!(session_id = session.id(), error = %e, "writer task failed");
    }
    debug!(session_id = session.id(), "connection finished");
}
