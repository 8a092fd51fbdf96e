//! Recognition gateway: uploads buffered PCM to the external speech-to-text service.

use async_trait::async_trait;
use tracing::debug;

use voxrelay_core::config::UpstreamConfig;
use voxrelay_core::error::{RelayError, Result};
use voxrelay_core::types::{RecognitionParams, Transcription};

use crate::Recognizer;
use crate::pcm::duration_ms;

/// HTTP client for the recognition service (`POST <asr_url>?sr=&ch=&lang=`,
/// multipart field `file`).
pub struct RecognitionGateway {
    client: reqwest::Client,
    url: String,
}

impl RecognitionGateway {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .build()
            .map_err(|e| RelayError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: config.asr_url.clone(),
        })
    }
}

#[async_trait]
impl Recognizer for RecognitionGateway {
    async fn recognize(&self, pcm: &[u8], params: &RecognitionParams) -> Result<Transcription> {
        // The service rejects empty uploads; an empty buffer has nothing to say.
        if pcm.is_empty() {
            debug!("Empty audio buffer, skipping recognition call");
            return Ok(Transcription::default());
        }

        debug!(
            url = %self.url,
            bytes = pcm.len(),
            audio_ms = duration_ms(pcm.len(), params.sample_rate, params.channels),
            lang = %params.language,
            "Sending audio for recognition"
        );

        let part = reqwest::multipart::Part::bytes(pcm.to_vec())
            .file_name("audio.pcm")
            .mime_str("application/octet-stream")
            .map_err(|e| RelayError::upstream(None, format!("ASR request failed: {e}")))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let resp = self
            .client
            .post(&self.url)
            .query(&[
                ("sr", params.sample_rate.to_string()),
                ("ch", params.channels.to_string()),
                ("lang", params.language.clone()),
            ])
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                RelayError::upstream(
                    e.status().map(|s| s.as_u16()),
                    format!("ASR request failed: {e}"),
                )
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(RelayError::upstream(
                Some(status.as_u16()),
                format!("ASR request failed: {body}"),
            ));
        }

        let transcription: Transcription = resp
            .json()
            .await
            .map_err(|e| RelayError::upstream(None, format!("Invalid ASR response: {e}")))?;

        debug!(
            chars = transcription.text.len(),
            segments = transcription.segments.len(),
            "Recognition complete"
        );
        Ok(transcription)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::extract::{Multipart, Query};
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::json;

    use super::*;

    fn upstream(asr_url: &str) -> UpstreamConfig {
        UpstreamConfig {
            asr_url: asr_url.to_string(),
            tts_ws_url: "ws://127.0.0.1:9/ws/tts".into(),
            http_timeout_secs: 5.0,
            ws_timeout_secs: 5.0,
        }
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    /// Echoes what it received back as the recognized text.
    async fn echo_stt(
        Query(query): Query<HashMap<String, String>>,
        mut multipart: Multipart,
    ) -> Json<serde_json::Value> {
        let mut received = String::new();
        while let Some(field) = multipart.next_field().await.unwrap() {
            let name = field.file_name().unwrap_or_default().to_string();
            let len = field.bytes().await.unwrap().len();
            received = format!("{name}:{len}");
        }
        Json(json!({
            "text": format!("{}/{}/{}/{received}", query["sr"], query["ch"], query["lang"]),
            "segments": [{"start_ms": 0, "end_ms": 1000, "text": "hello"}],
        }))
    }

    #[tokio::test]
    async fn test_empty_buffer_skips_remote_call() {
        // Nothing listens on port 9; a request would fail.
        let gateway = RecognitionGateway::new(&upstream("http://127.0.0.1:9/stt")).unwrap();
        let result = gateway
            .recognize(&[], &RecognitionParams::default())
            .await
            .unwrap();
        assert_eq!(result, Transcription::default());
    }

    #[tokio::test]
    async fn test_uploads_pcm_with_params() {
        let base = serve(Router::new().route("/api/stt/bytes", post(echo_stt))).await;
        let gateway =
            RecognitionGateway::new(&upstream(&format!("{base}/api/stt/bytes"))).unwrap();

        let params = RecognitionParams {
            sample_rate: 8000,
            channels: 2,
            language: "de".into(),
        };
        let result = gateway.recognize(&[0u8; 3200], &params).await.unwrap();
        assert_eq!(result.text, "8000/2/de/audio.pcm:3200");
        assert_eq!(result.segments.len(), 1);
        assert_eq!(result.segments[0].end_ms, 1000);
    }

    #[tokio::test]
    async fn test_non_success_is_upstream_failure() {
        let router = Router::new().route(
            "/stt",
            post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "Model not loaded yet") }),
        );
        let base = serve(router).await;
        let gateway = RecognitionGateway::new(&upstream(&format!("{base}/stt"))).unwrap();

        let err = gateway
            .recognize(&[1, 2, 3, 4], &RecognitionParams::default())
            .await
            .unwrap_err();
        match err {
            RelayError::UpstreamFailure { status, detail } => {
                assert_eq!(status, Some(503));
                assert!(detail.contains("Model not loaded yet"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_body_is_upstream_failure() {
        let router = Router::new().route("/stt", post(|| async { "not json" }));
        let base = serve(router).await;
        let gateway = RecognitionGateway::new(&upstream(&format!("{base}/stt"))).unwrap();

        let err = gateway
            .recognize(&[1, 2], &RecognitionParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::UpstreamFailure { status: None, .. }));
    }

    #[tokio::test]
    async fn test_connection_refused_is_upstream_failure() {
        let gateway = RecognitionGateway::new(&upstream("http://127.0.0.1:9/stt")).unwrap();
        let err = gateway
            .recognize(&[1, 2], &RecognitionParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::UpstreamFailure { status: None, .. }));
    }
}
