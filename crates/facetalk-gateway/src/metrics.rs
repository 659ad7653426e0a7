//! Prometheus metrics recording and endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::state::GatewayState;

/// Install the Prometheus metrics recorder and return the handle for rendering.
pub fn install_prometheus_recorder() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {e}"))
}

/// Record a new session connection.
pub fn record_ws_connect() {
    metrics::gauge!("ws_connections_active").increment(1.0);
}

/// Record a session disconnection.
pub fn record_ws_disconnect() {
    metrics::gauge!("ws_connections_active").decrement(1.0);
}

/// Record a refused connection by reason.
pub fn record_rejected(reason: &str) {
    let labels = [("reason", reason.to_string())];
    metrics::counter!("ws_connections_rejected_total", &labels).increment(1);
}

pub async fn metrics_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_prometheus_recorder() {
        // Only one recorder per process; a second install reports an error.
        if let Ok(handle) = install_prometheus_recorder() {
            let output = handle.render();
            assert!(output.is_empty() || output.contains("# "));
        }
    }

    #[test]
    fn test_recording_does_not_panic() {
        record_ws_connect();
        record_ws_disconnect();
        record_rejected("capacity");
    }
}
