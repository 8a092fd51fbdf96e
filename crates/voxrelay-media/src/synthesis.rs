//! Synthesis gateway: streams PCM from the remote synthesis service over WebSocket.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

use voxrelay_core::config::UpstreamConfig;
use voxrelay_core::error::{RelayError, Result};
use voxrelay_core::protocol::{ServerEvent, SynthesisPayload};

use crate::{PcmStream, Synthesizer};

type ServiceSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket client for the synthesis service.
///
/// Each call opens its own connection, sends `{"text": ...}`, and forwards
/// binary frames until `{"type": "end"}`. Any `{"error": ...}` frame, early
/// close, or idle period longer than the configured timeout becomes an
/// [`RelayError::UpstreamFailure`].
pub struct SynthesisGateway {
    url: String,
    timeout: Duration,
}

impl SynthesisGateway {
    pub fn new(config: &UpstreamConfig) -> Self {
        Self {
            url: config.tts_ws_url.clone(),
            timeout: config.ws_timeout(),
        }
    }

    async fn connect(&self) -> Result<ServiceSocket> {
        let connected = tokio::time::timeout(self.timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| {
                RelayError::upstream(None, "Timed out connecting to synthesis service")
            })?;

        match connected {
            Ok((socket, _)) => Ok(socket),
            Err(tungstenite::Error::Http(resp)) => Err(RelayError::upstream(
                Some(resp.status().as_u16()),
                "Synthesis service rejected the WebSocket handshake",
            )),
            Err(e) => Err(RelayError::upstream(
                None,
                format!("Synthesis service unreachable: {e}"),
            )),
        }
    }
}

#[async_trait]
impl Synthesizer for SynthesisGateway {
    async fn synthesize(&self, text: &str) -> Result<PcmStream> {
        let text = text.trim();
        if text.is_empty() {
            debug!("Empty synthesis text, not contacting synthesis service");
            return Ok(Box::pin(futures::stream::empty()));
        }

        let mut socket = self.connect().await?;
        let payload = serde_json::to_string(&SynthesisPayload {
            text: text.to_string(),
        })?;
        socket
            .send(Message::Text(payload.into()))
            .await
            .map_err(|e| RelayError::upstream(None, format!("Failed to send text: {e}")))?;

        debug!(url = %self.url, text_len = text.len(), "Synthesis request sent");

        let (chunk_tx, chunk_rx) = mpsc::channel(1);
        tokio::spawn(forward_chunks(socket, chunk_tx, self.timeout));
        Ok(Box::pin(ReceiverStream::new(chunk_rx)))
    }
}

/// Outcome of reading one frame from the service.
enum Frame {
    Chunk(Bytes),
    End,
    Skip,
}

fn interpret(msg: std::result::Result<Message, tungstenite::Error>) -> Result<Frame> {
    match msg {
        Ok(Message::Binary(chunk)) => Ok(Frame::Chunk(chunk)),
        Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(text.as_str()) {
            Ok(ServerEvent::StreamEnd { .. }) => Ok(Frame::End),
            Ok(ServerEvent::Error { error }) => Err(RelayError::upstream(None, error)),
            _ => {
                debug!(text = text.as_str(), "Ignoring unexpected text frame from synthesis service");
                Ok(Frame::Skip)
            }
        },
        Ok(Message::Close(_)) => Err(RelayError::upstream(
            None,
            "Synthesis service closed the stream before the end marker",
        )),
        Ok(_) => Ok(Frame::Skip),
        Err(e) => Err(RelayError::upstream(
            None,
            format!("Synthesis stream error: {e}"),
        )),
    }
}

async fn forward_chunks(
    mut socket: ServiceSocket,
    chunk_tx: mpsc::Sender<Result<Bytes>>,
    idle_timeout: Duration,
) {
    let mut chunks = 0usize;
    loop {
        let next = tokio::select! {
            _ = chunk_tx.closed() => {
                debug!(chunks, "Synthesis consumer dropped, closing service connection");
                break;
            }
            next = tokio::time::timeout(idle_timeout, socket.next()) => next,
        };

        let frame = match next {
            Err(_) => Err(RelayError::upstream(None, "Synthesis service timed out")),
            Ok(None) => Err(RelayError::upstream(
                None,
                "Synthesis service disconnected before the end marker",
            )),
            Ok(Some(msg)) => interpret(msg),
        };

        match frame {
            Ok(Frame::Chunk(chunk)) => {
                chunks += 1;
                if chunk_tx.send(Ok(chunk)).await.is_err() {
                    break;
                }
            }
            Ok(Frame::Skip) => {}
            Ok(Frame::End) => {
                debug!(chunks, "Synthesis stream complete");
                break;
            }
            Err(e) => {
                warn!(%e, chunks, "Synthesis stream failed");
                let _ = chunk_tx.send(Err(e)).await;
                break;
            }
        }
    }

    let _ = socket.close(None).await;
}
