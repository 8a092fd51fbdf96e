//! WebSocket connection lifecycle for `/ws/gateway`.

use std::sync::Arc;

use axum::extract::ws::WebSocket;
use futures::StreamExt;
use tracing::info;

use crate::session::DuplexSession;
use crate::state::GatewayState;

/// Drive one duplex session over an upgraded socket.
pub async fn handle_ws_connection(state: Arc<GatewayState>, ws: WebSocket) {
    let _guard = state.track_session();

    let mut session = DuplexSession::new(
        Arc::clone(&state.recognizer),
        Arc::clone(&state.synthesizer),
        state.recognition.clone(),
    );
    info!(
        session_id = %session.id(),
        live_sessions = state.session_count(),
        "New gateway connection"
    );

    let (ws_tx, ws_rx) = ws.split();
    session.run(ws_rx, ws_tx).await;
}
