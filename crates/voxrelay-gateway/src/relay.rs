//! One-shot HTTP relay: `POST /api/gateway/tts-from-audio?sr=&ch=&lang=`.
//!
//! Takes a multipart `file` of raw PCM, recognizes it, synthesizes the text,
//! and returns both as JSON with the audio base64-encoded.

use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::extract::{Multipart, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use voxrelay_core::error::RelayError;
use voxrelay_core::protocol::RelayResponse;
use voxrelay_core::types::RecognitionParams;
use voxrelay_media::collect_pcm;

use crate::state::GatewayState;

#[derive(Debug, Default, Deserialize)]
pub struct RelayQuery {
    pub sr: Option<u32>,
    pub ch: Option<u16>,
    pub lang: Option<String>,
}

impl RelayQuery {
    fn params(self, defaults: &RecognitionParams) -> RecognitionParams {
        RecognitionParams {
            sample_rate: self.sr.unwrap_or(defaults.sample_rate),
            channels: self.ch.unwrap_or(defaults.channels),
            language: self.lang.unwrap_or_else(|| defaults.language.clone()),
        }
    }
}

/// Error body `{"detail": ...}` with a status derived from the failure.
#[derive(Debug)]
pub struct RelayRejection {
    status: StatusCode,
    detail: String,
}

impl RelayRejection {
    fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            detail: detail.into(),
        }
    }
}

impl From<RelayError> for RelayRejection {
    fn from(e: RelayError) -> Self {
        let status = match &e {
            RelayError::UpstreamFailure { .. } | RelayError::CorruptedStream(_) => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            detail: e.to_string(),
        }
    }
}

impl IntoResponse for RelayRejection {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

pub async fn tts_from_audio(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<RelayQuery>,
    mut multipart: Multipart,
) -> Result<Json<RelayResponse>, RelayRejection> {
    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| RelayRejection::bad_request(format!("invalid multipart body: {e}")))?
    {
        if field.name() == Some("file") {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| RelayRejection::bad_request(format!("failed to read upload: {e}")))?;
            upload = Some(bytes);
        }
    }

    let pcm = upload.ok_or_else(|| RelayRejection::bad_request("missing `file` field"))?;
    if pcm.is_empty() {
        return Err(RelayRejection::bad_request("empty audio upload"));
    }

    let params = query.params(&state.recognition);
    let started = Instant::now();
    let result = relay(&state, &pcm, &params).await;
    match &result {
        Ok(response) => info!(
            audio_bytes = pcm.len(),
            text = %response.asr_text,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "HTTP relay complete"
        ),
        Err(e) => {
            warn!(kind = e.kind(), %e, "HTTP relay failed");
            #[cfg(feature = "metrics")]
            crate::metrics::record_error(e.kind());
        }
    }
    Ok(Json(result?))
}

async fn relay(
    state: &GatewayState,
    pcm: &[u8],
    params: &RecognitionParams,
) -> Result<RelayResponse, RelayError> {
    let transcription = state.recognizer.recognize(pcm, params).await?;
    let stream = state.synthesizer.synthesize(&transcription.text).await?;
    let audio = collect_pcm(stream).await?;

    Ok(RelayResponse {
        asr_text: transcription.text,
        tts_audio_b64: STANDARD.encode(audio),
    })
}
