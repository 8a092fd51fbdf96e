//! Axum-based synthesis service.

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};
use uuid::Uuid;

use voxrelay_core::config::TtsConfig;
use voxrelay_core::error::Result;
use voxrelay_core::protocol::{ServerEvent, SynthesisPayload};
use voxrelay_media::Synthesizer;
use voxrelay_media::supervisor::SynthesisSupervisor;

/// Shared synthesis service state.
pub struct TtsState {
    pub synthesizer: Arc<dyn Synthesizer>,
    pub sample_rate: u32,
}

impl TtsState {
    pub fn new(synthesizer: Arc<dyn Synthesizer>, sample_rate: u32) -> Self {
        Self {
            synthesizer,
            sample_rate,
        }
    }

    /// Resolve the engine binary and voice model; fails with
    /// `MissingDependency` when either is absent.
    pub fn from_config(config: &TtsConfig) -> Result<Self> {
        let supervisor = SynthesisSupervisor::from_config(config)?;
        Ok(Self::new(Arc::new(supervisor), config.sample_rate))
    }
}

pub fn router(state: Arc<TtsState>) -> Router {
    Router::new()
        .route("/ws/tts", get(ws_handler))
        .route("/healthz", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the synthesis service on `addr` until `shutdown` is cancelled.
pub async fn start_tts_service(
    state: Arc<TtsState>,
    addr: &str,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Synthesis service listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("Synthesis service shutting down");
        })
        .await?;

    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<TtsState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_tts_connection(state, socket))
}

async fn health_handler(State(state): State<Arc<TtsState>>) -> impl IntoResponse {
    axum::Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sample_rate": state.sample_rate,
    }))
}

/// The client went away mid-reply.
struct Disconnected;

async fn handle_tts_connection(state: Arc<TtsState>, mut socket: WebSocket) {
    let conn_id = Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, "New synthesis connection");

    while let Some(msg) = socket.recv().await {
        let raw = match msg {
            Ok(Message::Text(raw)) => raw,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let payload: SynthesisPayload = match serde_json::from_str(raw.as_str()) {
            Ok(payload) => payload,
            Err(_) => {
                if send_event(&mut socket, &ServerEvent::error("invalid json")).await.is_err() {
                    break;
                }
                continue;
            }
        };

        let text = payload.text.trim();
        if text.is_empty() {
            if send_event(&mut socket, &ServerEvent::error("empty text")).await.is_err() {
                break;
            }
            continue;
        }

        info!(conn_id = %conn_id, text_len = text.len(), "Generating speech");
        if stream_reply(&state, &mut socket, text).await.is_err() {
            break;
        }
    }

    info!(conn_id = %conn_id, "Synthesis client disconnected");
}

/// Stream one synthesis result. Returning early drops the chunk stream,
/// which tears down the engine process.
async fn stream_reply(
    state: &TtsState,
    socket: &mut WebSocket,
    text: &str,
) -> std::result::Result<(), Disconnected> {
    let mut stream = match state.synthesizer.synthesize(text).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(kind = e.kind(), %e, "Synthesis failed to start");
            return send_event(socket, &ServerEvent::error(e.to_string())).await;
        }
    };

    let mut chunks = 0usize;
    while let Some(item) = stream.next().await {
        match item {
            Ok(chunk) => {
                socket
                    .send(Message::Binary(chunk))
                    .await
                    .map_err(|_| Disconnected)?;
                chunks += 1;
            }
            Err(e) => {
                error!(kind = e.kind(), %e, chunks, "Synthesis streaming error");
                return send_event(socket, &ServerEvent::error(e.to_string())).await;
            }
        }
    }

    debug!(chunks, "Synthesis reply complete");
    send_event(socket, &ServerEvent::end()).await
}

async fn send_event(
    socket: &mut WebSocket,
    event: &ServerEvent,
) -> std::result::Result<(), Disconnected> {
    let json = event.to_json().map_err(|e| {
        error!(%e, "Failed to serialize event");
        Disconnected
    })?;
    socket
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| Disconnected)
}
