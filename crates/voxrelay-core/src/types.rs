//! Value types shared between the gateway, the synthesis service, and clients.

use serde::{Deserialize, Serialize};

/// A timed span of recognized speech.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
}

/// Recognition engine output: full text plus the segments it was built from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcription {
    pub text: String,
    #[serde(default)]
    pub segments: Vec<Segment>,
}

impl Transcription {
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Describes the PCM handed to the recognition engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionParams {
    pub sample_rate: u32,
    pub channels: u16,
    pub language: String,
}

impl Default for RecognitionParams {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            language: "en".into(),
        }
    }
}
