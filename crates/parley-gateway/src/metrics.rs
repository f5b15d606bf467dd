//! Prometheus metrics recording and endpoint.

use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

static HANDLE: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Install the Prometheus recorder once per process and return its handle.
///
/// Returns `None` when another recorder is already installed.
pub fn prometheus_handle() -> Option<PrometheusHandle> {
    HANDLE
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!("Prometheus recorder unavailable: {e}");
                None
            }
        })
        .clone()
}

/// Record a call starting.
pub fn record_session_start() {
    metrics::gauge!("voice_sessions_active").increment(1.0);
    metrics::counter!("voice_sessions_total").increment(1);
}

/// Record a call ending with its final pipeline state.
pub fn record_session_end(outcome: &str, duration_secs: f64, interruptions: u64) {
    metrics::gauge!("voice_sessions_active").decrement(1.0);
    let labels = [("outcome", outcome.to_string())];
    metrics::counter!("voice_session_outcomes_total", &labels).increment(1);
    metrics::histogram!("voice_session_duration_seconds").record(duration_secs);
    metrics::counter!("voice_interruptions_total").increment(interruptions);
}

/// Record an error of a given kind.
pub fn record_error(kind: &str) {
    let labels = [("kind", kind.to_string())];
    metrics::counter!("errors_total", &labels).increment(1);
}
