//! Media pipeline: PCM chunking, recognition and synthesis adapters, and the
//! streaming synthesis supervisor.
//!
//! [`Recognizer`] and [`Synthesizer`] are the seams the gateway session is
//! written against. Remote implementations live in [`recognition`] and
//! [`synthesis`]; [`supervisor`] drives a local synthesis process.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};

use voxrelay_core::error::Result;
use voxrelay_core::types::{RecognitionParams, Transcription};

pub mod chunk;
pub mod pcm;
pub mod recognition;
pub mod supervisor;
pub mod synthesis;

/// Ordered raw PCM chunks. An `Err` item is terminal; the stream ends after it.
pub type PcmStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Speech-to-text engine reached across a process or network boundary.
#[async_trait]
pub trait Recognizer: Send + Sync {
    /// Transcribe raw little-endian 16-bit PCM.
    async fn recognize(&self, pcm: &[u8], params: &RecognitionParams) -> Result<Transcription>;
}

/// Text-to-speech engine producing raw PCM.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Start synthesizing `text`. Empty or whitespace-only text yields an
    /// empty stream without contacting the engine.
    async fn synthesize(&self, text: &str) -> Result<PcmStream>;
}

/// Drain a PCM stream into one buffer, stopping at the first error.
pub async fn collect_pcm(mut stream: PcmStream) -> Result<Vec<u8>> {
    let mut pcm = Vec::new();
    while let Some(chunk) = stream.next().await {
        pcm.extend_from_slice(&chunk?);
    }
    Ok(pcm)
}
