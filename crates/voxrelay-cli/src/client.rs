//! Client commands: stream text to the synthesis service, or audio through the gateway.

use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use voxrelay_core::config::UpstreamConfig;
use voxrelay_core::protocol::{CLOSE_COMMAND, FLUSH_COMMAND, ServerEvent};
use voxrelay_media::Synthesizer;
use voxrelay_media::chunk::chunk_pcm;
use voxrelay_media::synthesis::SynthesisGateway;

/// `ws://host:port/path`, with wildcard bind hosts replaced by loopback.
pub fn ws_url(host: &str, port: u16, path: &str) -> String {
    let host = match host {
        "0.0.0.0" | "::" | "[::]" => "127.0.0.1",
        other => other,
    };
    format!("ws://{host}:{port}{path}")
}

#[derive(Debug)]
pub struct SpeakReport {
    pub pcm: Vec<u8>,
    pub chunks: usize,
    pub first_chunk: Option<Duration>,
    pub total: Duration,
}

/// Stream `text` through the synthesis service at `url`.
pub async fn speak(url: &str, text: &str, timeout: Duration) -> anyhow::Result<SpeakReport> {
    let gateway = SynthesisGateway::new(&UpstreamConfig {
        asr_url: String::new(),
        tts_ws_url: url.to_string(),
        http_timeout_secs: timeout.as_secs_f64(),
        ws_timeout_secs: timeout.as_secs_f64(),
    });

    let started = Instant::now();
    let mut stream = gateway.synthesize(text).await?;
    let mut report = SpeakReport {
        pcm: Vec::new(),
        chunks: 0,
        first_chunk: None,
        total: Duration::ZERO,
    };

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if report.first_chunk.is_none() {
            report.first_chunk = Some(started.elapsed());
        }
        report.chunks += 1;
        report.pcm.extend_from_slice(&chunk);
        debug!(chunk = report.chunks, bytes = chunk.len(), "Received chunk");
    }

    report.total = started.elapsed();
    Ok(report)
}

#[derive(Debug)]
pub struct RelayOutcome {
    pub asr_text: String,
    pub pcm: Vec<u8>,
    pub chunks: usize,
}

/// Send `pcm` to the gateway in `frame_bytes` frames, flush, and collect the reply.
pub async fn relay(url: &str, pcm: &[u8], frame_bytes: usize) -> anyhow::Result<RelayOutcome> {
    let (mut ws, _) = connect_async(url)
        .await
        .with_context(|| format!("failed to connect to {url}"))?;

    let mut frames = 0usize;
    for frame in chunk_pcm(pcm, frame_bytes) {
        ws.send(Message::Binary(frame.to_vec().into())).await?;
        frames += 1;
    }
    debug!(frames, bytes = pcm.len(), "Audio sent, flushing");
    ws.send(Message::Text(FLUSH_COMMAND.into())).await?;

    let mut outcome = RelayOutcome {
        asr_text: String::new(),
        pcm: Vec::new(),
        chunks: 0,
    };

    loop {
        let Some(msg) = ws.next().await else {
            bail!("gateway disconnected before the end marker");
        };
        match msg? {
            Message::Binary(chunk) => {
                outcome.pcm.extend_from_slice(&chunk);
                outcome.chunks += 1;
            }
            Message::Text(text) => match serde_json::from_str::<ServerEvent>(text.as_str())? {
                ServerEvent::Transcript { asr_text } => outcome.asr_text = asr_text,
                ServerEvent::StreamEnd { .. } => break,
                ServerEvent::Error { error } => bail!("gateway error: {error}"),
            },
            Message::Close(_) => bail!("gateway closed the connection before the end marker"),
            _ => {}
        }
    }

    let _ = ws.send(Message::Text(CLOSE_COMMAND.into())).await;
    let _ = ws.close(None).await;
    Ok(outcome)
}
