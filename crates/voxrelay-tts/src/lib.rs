//! Streaming synthesis service.
//!
//! Exposes a [`voxrelay_media::Synthesizer`] (normally a
//! [`SynthesisSupervisor`](voxrelay_media::supervisor::SynthesisSupervisor))
//! over `/ws/tts`: each `{"text": ...}` frame is answered with binary PCM
//! chunks and `{"type": "end"}`, or `{"error": ...}`.

pub mod server;

pub use server::{TtsState, router, start_tts_service};
