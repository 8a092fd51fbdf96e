//! Wire protocol for the duplex gateway session and the synthesis service.
//!
//! Client -> gateway: binary frames carry raw little-endian 16-bit PCM, text
//! frames carry one of the control sentinels. Gateway/service -> client: JSON
//! text events and binary PCM chunks.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Ends buffering and triggers the recognize -> synthesize round trip.
pub const FLUSH_COMMAND: &str = "__flush__";

/// Terminates the session loop.
pub const CLOSE_COMMAND: &str = "__close__";

/// One inbound session frame, decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    AppendAudio(Bytes),
    Flush,
    Close,
    Unknown(String),
}

impl SessionCommand {
    /// Decode a text frame. Surrounding whitespace is ignored.
    pub fn from_text(text: &str) -> Self {
        match text.trim() {
            FLUSH_COMMAND => Self::Flush,
            CLOSE_COMMAND => Self::Close,
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// JSON text events sent back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerEvent {
    /// Recognized text for the flushed buffer.
    Transcript { asr_text: String },
    /// Marks the end of a synthesis stream.
    StreamEnd {
        #[serde(rename = "type")]
        kind: StreamMarker,
    },
    Error { error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMarker {
    End,
}

impl ServerEvent {
    pub fn transcript(text: impl Into<String>) -> Self {
        Self::Transcript {
            asr_text: text.into(),
        }
    }

    pub fn end() -> Self {
        Self::StreamEnd {
            kind: StreamMarker::End,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Request frame accepted by the synthesis service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SynthesisPayload {
    #[serde(default)]
    pub text: String,
}

/// Response of the one-shot HTTP relay endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayResponse {
    pub asr_text: String,
    pub tts_audio_b64: String,
}
