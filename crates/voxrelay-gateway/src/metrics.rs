//! Prometheus metrics recording and endpoint.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus metrics recorder and return the handle for rendering.
///
/// Fails if a recorder is already installed in this process.
pub fn install_prometheus_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(handle)
}

/// Record a new duplex session.
pub fn record_session_open() {
    metrics::gauge!("gateway_sessions_active").increment(1.0);
}

/// Record a duplex session ending.
pub fn record_session_close() {
    metrics::gauge!("gateway_sessions_active").decrement(1.0);
}

/// Record a finished round trip (`ok` or `error`) with its duration.
pub fn record_round_trip(outcome: &str, duration_secs: f64) {
    let labels = [("outcome", outcome.to_string())];
    metrics::counter!("gateway_round_trips_total", &labels).increment(1);
    metrics::histogram!("gateway_round_trip_duration_seconds", &labels).record(duration_secs);
}

/// Record an error of a given kind.
pub fn record_error(kind: &str) {
    let labels = [("kind", kind.to_string())];
    metrics::counter!("gateway_errors_total", &labels).increment(1);
}
