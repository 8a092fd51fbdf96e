//! Gateway shared state.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use voxrelay_core::config::Config;
use voxrelay_core::error::Result;
use voxrelay_core::types::RecognitionParams;
use voxrelay_media::recognition::RecognitionGateway;
use voxrelay_media::synthesis::SynthesisGateway;
use voxrelay_media::{Recognizer, Synthesizer};

/// Shared gateway state accessible from all connections and handlers.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub recognizer: Arc<dyn Recognizer>,
    pub synthesizer: Arc<dyn Synthesizer>,
    /// Defaults for WebSocket sessions and HTTP requests without query overrides.
    pub recognition: RecognitionParams,
    active_sessions: AtomicUsize,
    #[cfg(feature = "metrics")]
    pub metrics: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

impl GatewayState {
    pub fn new(
        config: Arc<Config>,
        recognizer: Arc<dyn Recognizer>,
        synthesizer: Arc<dyn Synthesizer>,
    ) -> Self {
        let recognition = config.recognition.clone();
        Self {
            config,
            recognizer,
            synthesizer,
            recognition,
            active_sessions: AtomicUsize::new(0),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Wire the remote recognition and synthesis services from `upstream`.
    pub fn from_config(config: Arc<Config>) -> Result<Self> {
        let upstream = config.upstream()?;
        let recognizer = Arc::new(RecognitionGateway::new(upstream)?);
        let synthesizer = Arc::new(SynthesisGateway::new(upstream));
        Ok(Self::new(config, recognizer, synthesizer))
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, handle: metrics_exporter_prometheus::PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub fn session_count(&self) -> usize {
        self.active_sessions.load(Ordering::SeqCst)
    }

    /// Count a session as live until the returned guard is dropped.
    pub fn track_session(self: &Arc<Self>) -> SessionGuard {
        self.active_sessions.fetch_add(1, Ordering::SeqCst);
        #[cfg(feature = "metrics")]
        crate::metrics::record_session_open();
        SessionGuard {
            state: Arc::clone(self),
        }
    }
}

pub struct SessionGuard {
    state: Arc<GatewayState>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.state.active_sessions.fetch_sub(1, Ordering::SeqCst);
        #[cfg(feature = "metrics")]
        crate::metrics::record_session_close();
    }
}
