//! Duplex session: one per WebSocket connection.
//!
//! Binary frames append to the audio buffer. `__flush__` runs one round trip
//! (recognize the buffer, send `{"asr_text"}`, forward synthesized PCM chunks,
//! send `{"type": "end"}`). `__close__` ends the session. Frames are handled
//! strictly one at a time, so round trips never interleave.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use voxrelay_core::error::RelayError;
use voxrelay_core::protocol::{ServerEvent, SessionCommand};
use voxrelay_core::types::RecognitionParams;
use voxrelay_media::{Recognizer, Synthesizer};

/// PCM received since the last flush.
#[derive(Debug, Default)]
pub struct AudioBuffer {
    pcm: Vec<u8>,
}

impl AudioBuffer {
    pub fn append(&mut self, bytes: &[u8]) {
        self.pcm.extend_from_slice(bytes);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.pcm
    }

    pub fn len(&self) -> usize {
        self.pcm.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pcm.is_empty()
    }

    pub fn clear(&mut self) {
        self.pcm.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Listening,
    Buffering,
    RoundTrip,
    Streaming,
    Closed,
}

/// The peer went away; nothing more can be sent.
#[derive(Debug)]
struct Disconnected;

enum RoundTripError {
    Relay(RelayError),
    Disconnected,
}

impl From<RelayError> for RoundTripError {
    fn from(e: RelayError) -> Self {
        Self::Relay(e)
    }
}

impl From<Disconnected> for RoundTripError {
    fn from(_: Disconnected) -> Self {
        Self::Disconnected
    }
}

pub struct DuplexSession {
    id: String,
    recognizer: Arc<dyn Recognizer>,
    synthesizer: Arc<dyn Synthesizer>,
    params: RecognitionParams,
    buffer: AudioBuffer,
    state: SessionState,
}

impl DuplexSession {
    pub fn new(
        recognizer: Arc<dyn Recognizer>,
        synthesizer: Arc<dyn Synthesizer>,
        params: RecognitionParams,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            recognizer,
            synthesizer,
            params,
            buffer: AudioBuffer::default(),
            state: SessionState::Listening,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Process inbound frames until close, disconnect, or a failed send.
    ///
    /// `outbound` is closed after an explicit `__close__` and dropped otherwise.
    pub async fn run<I, E, O>(&mut self, mut inbound: I, mut outbound: O)
    where
        I: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
        O: Sink<Message> + Unpin,
    {
        info!(session_id = %self.id, "Session started");

        while let Some(frame) = inbound.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(session_id = %self.id, %e, "Transport error, ending session");
                    break;
                }
            };

            let command = match frame {
                Message::Binary(bytes) => SessionCommand::AppendAudio(bytes),
                Message::Text(text) => SessionCommand::from_text(text.as_str()),
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) => continue,
            };

            match command {
                SessionCommand::AppendAudio(bytes) => {
                    self.buffer.append(&bytes);
                    self.state = SessionState::Buffering;
                }
                SessionCommand::Flush => {
                    if self.round_trip(&mut outbound).await.is_err() {
                        break;
                    }
                }
                SessionCommand::Close => {
                    debug!(session_id = %self.id, "Close requested");
                    let _ = outbound.close().await;
                    break;
                }
                SessionCommand::Unknown(raw) => {
                    let violation = RelayError::ProtocolViolation(format!("unknown command {raw:?}"));
                    warn!(session_id = %self.id, %violation, "Rejecting text frame");
                    #[cfg(feature = "metrics")]
                    crate::metrics::record_error(violation.kind());
                    if send_event(&mut outbound, &ServerEvent::error("unknown command"))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }

        self.state = SessionState::Closed;
        info!(session_id = %self.id, buffered = self.buffer.len(), "Session closed");
    }

    /// Run one round trip and clear the buffer whatever the outcome.
    async fn round_trip<O>(&mut self, outbound: &mut O) -> Result<(), Disconnected>
    where
        O: Sink<Message> + Unpin,
    {
        self.state = SessionState::RoundTrip;
        let started = Instant::now();
        let result = self.exchange(outbound).await;
        let buffered = self.buffer.len();
        self.buffer.clear();
        self.state = SessionState::Listening;

        match result {
            Ok(chunks) => {
                info!(
                    session_id = %self.id,
                    audio_bytes = buffered,
                    chunks,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Round trip complete"
                );
                #[cfg(feature = "metrics")]
                crate::metrics::record_round_trip("ok", started.elapsed().as_secs_f64());
                Ok(())
            }
            Err(RoundTripError::Relay(e)) => {
                warn!(session_id = %self.id, kind = e.kind(), %e, "Round trip failed");
                #[cfg(feature = "metrics")]
                {
                    crate::metrics::record_round_trip("error", started.elapsed().as_secs_f64());
                    crate::metrics::record_error(e.kind());
                }
                send_event(outbound, &ServerEvent::error(e.to_string())).await
            }
            Err(RoundTripError::Disconnected) => {
                debug!(session_id = %self.id, "Peer left during round trip");
                Err(Disconnected)
            }
        }
    }

    /// Returns the number of PCM chunks forwarded.
    async fn exchange<O>(&mut self, outbound: &mut O) -> Result<usize, RoundTripError>
    where
        O: Sink<Message> + Unpin,
    {
        if self.buffer.is_empty() {
            debug!(session_id = %self.id, "Flush with empty buffer");
        }
        let transcription = self
            .recognizer
            .recognize(self.buffer.as_slice(), &self.params)
            .await?;
        if transcription.is_empty() {
            debug!(session_id = %self.id, "Nothing recognized");
        } else {
            debug!(session_id = %self.id, text = %transcription.text, "Recognized");
        }
        send_event(outbound, &ServerEvent::transcript(transcription.text.clone())).await?;

        let mut stream = self.synthesizer.synthesize(&transcription.text).await?;
        self.state = SessionState::Streaming;

        // Returning early drops `stream`, which stops the synthesis.
        let mut chunks = 0usize;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            outbound
                .send(Message::Binary(chunk))
                .await
                .map_err(|_| RoundTripError::Disconnected)?;
            chunks += 1;
        }

        send_event(outbound, &ServerEvent::end()).await?;
        Ok(chunks)
    }
}

async fn send_event<O>(outbound: &mut O, event: &ServerEvent) -> Result<(), Disconnected>
where
    O: Sink<Message> + Unpin,
{
    // A frame that cannot be encoded ends the session rather than being skipped.
    let json = event.to_json().map_err(|e| {
        error!(%e, "Failed to serialize event");
        Disconnected
    })?;
    outbound
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| Disconnected)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::channel::mpsc;
    use voxrelay_core::error::Result;
    use voxrelay_core::types::Transcription;
    use voxrelay_media::PcmStream;

    use super::*;

    /// Recognizes every buffer as "<n> bytes".
    struct CountingRecognizer {
        fail: bool,
        calls: Mutex<Vec<usize>>,
    }

    impl CountingRecognizer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                fail: false,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                fail: true,
                calls: Mutex::new(Vec::new()),
            })
        }

        /// Returns empty text for an empty buffer.
        fn text_for(len: usize) -> String {
            if len == 0 {
                String::new()
            } else {
                format!("{len} bytes")
            }
        }
    }

    #[async_trait]
    impl Recognizer for CountingRecognizer {
        async fn recognize(&self, pcm: &[u8], _params: &RecognitionParams) -> Result<Transcription> {
            self.calls.lock().unwrap().push(pcm.len());
            if self.fail {
                return Err(RelayError::upstream(Some(503), "Model not loaded yet"));
            }
            Ok(Transcription {
                text: Self::text_for(pcm.len()),
                segments: Vec::new(),
            })
        }
    }

    /// Emits one 4-byte chunk per word, optionally failing after the first.
    struct WordSynthesizer {
        fail_after_first: bool,
        calls: Mutex<Vec<String>>,
    }

    impl WordSynthesizer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                fail_after_first: false,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn corrupting() -> Arc<Self> {
            Arc::new(Self {
                fail_after_first: true,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Synthesizer for WordSynthesizer {
        async fn synthesize(&self, text: &str) -> Result<PcmStream> {
            self.calls.lock().unwrap().push(text.to_string());
            let mut items: Vec<Result<Bytes>> = text
                .split_whitespace()
                .map(|_| Ok(Bytes::from_static(&[0, 1, 2, 3])))
                .collect();
            if self.fail_after_first {
                items.truncate(1);
                items.push(Err(RelayError::CorruptedStream(
                    "Synthesis stdout contained text instead of PCM".into(),
                )));
            }
            Ok(Box::pin(futures::stream::iter(items)))
        }
    }

    fn audio(len: usize) -> std::result::Result<Message, axum::Error> {
        Ok(Message::Binary(Bytes::from(vec![0u8; len])))
    }

    fn text(raw: &'static str) -> std::result::Result<Message, axum::Error> {
        Ok(Message::Text(raw.into()))
    }

    /// Run a session over `frames` and return every frame it sent.
    async fn run_session(
        session: &mut DuplexSession,
        frames: Vec<std::result::Result<Message, axum::Error>>,
    ) -> Vec<Message> {
        let (tx, rx) = mpsc::unbounded();
        session.run(futures::stream::iter(frames), tx).await;
        rx.collect().await
    }

    fn json(msg: &Message) -> serde_json::Value {
        match msg {
            Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_round_trip_frame_order() {
        let recognizer = CountingRecognizer::new();
        let synthesizer = WordSynthesizer::new();
        let mut session = DuplexSession::new(
            recognizer.clone(),
            synthesizer.clone(),
            RecognitionParams::default(),
        );

        let sent = run_session(&mut session, vec![audio(3200), audio(800), text("__flush__")]).await;

        assert_eq!(sent.len(), 4);
        assert_eq!(json(&sent[0])["asr_text"], "4000 bytes");
        assert!(matches!(&sent[1], Message::Binary(b) if b.len() == 4));
        assert!(matches!(&sent[2], Message::Binary(b) if b.len() == 4));
        assert_eq!(json(&sent[3])["type"], "end");

        assert_eq!(*recognizer.calls.lock().unwrap(), vec![4000]);
        assert_eq!(*synthesizer.calls.lock().unwrap(), vec!["4000 bytes"]);
        assert_eq!(session.buffered_bytes(), 0);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_back_to_back_flushes_do_not_interleave() {
        let recognizer = CountingRecognizer::new();
        let mut session = DuplexSession::new(
            recognizer.clone(),
            WordSynthesizer::new(),
            RecognitionParams::default(),
        );

        let sent = run_session(
            &mut session,
            vec![audio(10), text("__flush__"), audio(20), text("__flush__")],
        )
        .await;

        let shape: Vec<String> = sent
            .iter()
            .map(|msg| match msg {
                Message::Binary(_) => "pcm".to_string(),
                other => {
                    let value = json(other);
                    value
                        .get("asr_text")
                        .map(|t| format!("text:{}", t.as_str().unwrap()))
                        .unwrap_or_else(|| "end".to_string())
                }
            })
            .collect();
        assert_eq!(
            shape,
            vec![
                "text:10 bytes",
                "pcm",
                "pcm",
                "end",
                "text:20 bytes",
                "pcm",
                "pcm",
                "end"
            ]
        );
        // The second flush only saw audio sent after the first.
        assert_eq!(*recognizer.calls.lock().unwrap(), vec![10, 20]);
    }

    #[tokio::test]
    async fn test_unknown_command_keeps_buffer() {
        let recognizer = CountingRecognizer::new();
        let mut session = DuplexSession::new(
            recognizer.clone(),
            WordSynthesizer::new(),
            RecognitionParams::default(),
        );

        let sent = run_session(&mut session, vec![audio(640), text("hello there")]).await;

        assert_eq!(sent.len(), 1);
        assert_eq!(json(&sent[0]), serde_json::json!({"error": "unknown command"}));
        assert_eq!(session.buffered_bytes(), 640);
        assert!(recognizer.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_buffer_still_sends_end_marker() {
        let synthesizer = WordSynthesizer::new();
        let mut session = DuplexSession::new(
            CountingRecognizer::new(),
            synthesizer.clone(),
            RecognitionParams::default(),
        );

        let sent = run_session(&mut session, vec![text(" __flush__\n")]).await;

        assert_eq!(sent.len(), 2);
        assert_eq!(json(&sent[0])["asr_text"], "");
        assert_eq!(json(&sent[1])["type"], "end");
        assert_eq!(*synthesizer.calls.lock().unwrap(), vec![""]);
    }

    #[tokio::test]
    async fn test_recognition_failure_reports_and_clears_buffer() {
        let synthesizer = WordSynthesizer::new();
        let mut session = DuplexSession::new(
            CountingRecognizer::failing(),
            synthesizer.clone(),
            RecognitionParams::default(),
        );

        let sent = run_session(&mut session, vec![audio(320), text("__flush__")]).await;

        assert_eq!(sent.len(), 1);
        let error = json(&sent[0]);
        assert!(error["error"].as_str().unwrap().contains("Model not loaded yet"));
        assert_eq!(session.buffered_bytes(), 0);
        assert!(synthesizer.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_session_survives_failed_round_trip() {
        let mut session = DuplexSession::new(
            CountingRecognizer::new(),
            WordSynthesizer::corrupting(),
            RecognitionParams::default(),
        );

        let sent = run_session(
            &mut session,
            vec![audio(2), text("__flush__"), text("bogus")],
        )
        .await;

        assert_eq!(sent.len(), 4);
        assert_eq!(json(&sent[0])["asr_text"], "2 bytes");
        assert!(matches!(sent[1], Message::Binary(_)));
        assert!(json(&sent[2])["error"].as_str().unwrap().contains("contained text"));
        // Still accepting commands afterwards.
        assert_eq!(json(&sent[3])["error"], "unknown command");
    }

    #[tokio::test]
    async fn test_close_stops_processing() {
        let recognizer = CountingRecognizer::new();
        let mut session = DuplexSession::new(
            recognizer.clone(),
            WordSynthesizer::new(),
            RecognitionParams::default(),
        );

        let sent = run_session(
            &mut session,
            vec![audio(100), text("__close__"), text("__flush__")],
        )
        .await;

        assert!(sent.is_empty());
        assert!(recognizer.calls.lock().unwrap().is_empty());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_failed_send_ends_session() {
        let recognizer = CountingRecognizer::new();
        let mut session = DuplexSession::new(
            recognizer.clone(),
            WordSynthesizer::new(),
            RecognitionParams::default(),
        );

        let (tx, rx) = mpsc::unbounded::<Message>();
        drop(rx);
        let frames = vec![audio(4), text("__flush__"), audio(4), text("__flush__")];
        session.run(futures::stream::iter(frames), tx).await;

        // The first round trip hit the closed sink; the second never ran.
        assert_eq!(*recognizer.calls.lock().unwrap(), vec![4]);
        assert_eq!(session.state(), SessionState::Closed);
    }
}
