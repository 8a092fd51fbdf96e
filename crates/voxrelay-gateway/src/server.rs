//! Axum-based gateway server.

use std::sync::Arc;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::connection::handle_ws_connection;
use crate::relay::tts_from_audio;
use crate::state::GatewayState;

/// Build the gateway routes.
pub fn router(state: Arc<GatewayState>) -> Router {
    #[allow(unused_mut)]
    let mut app = Router::new()
        .route("/ws/gateway", get(ws_handler))
        .route("/api/gateway/tts-from-audio", post(tts_from_audio))
        .route("/healthz", get(health_handler));

    #[cfg(feature = "metrics")]
    if let Some(handle) = state.metrics.clone() {
        app = app.route("/metrics", get(move || async move { handle.render() }));
    }

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Serve the gateway on `addr` until `shutdown` is cancelled.
pub async fn start_gateway(
    state: Arc<GatewayState>,
    addr: &str,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Gateway listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("Gateway shutting down");
        })
        .await?;

    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(state, socket))
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let upstream = state.config.upstream.as_ref().map(|u| {
        json!({
            "asr_url": u.asr_url,
            "tts_ws_url": u.tts_ws_url,
        })
    });
    axum::Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.session_count(),
        "upstream": upstream,
    }))
}
