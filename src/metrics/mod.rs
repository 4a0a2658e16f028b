//! Prometheus metrics export.
//!
//! Counters and histograms are recorded inline where requests are proxied:
//!
//! - `baton_requests_total{model, backend}` - proxied requests
//! - `baton_upstream_errors_total{backend}` - failed upstream dispatches
//! - `baton_request_duration_seconds{model, backend}` - full stream lifetime

use axum::http::header;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return its render handle.
///
/// Buckets are sized for token-streamed responses, which run seconds to
/// minutes rather than milliseconds.
pub fn setup_metrics() -> Result<PrometheusHandle, Box<dyn std::error::Error>> {
    let duration_buckets = &[
        0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
    ];

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("baton_request_duration_seconds".to_string()),
            duration_buckets,
        )?
        .install_recorder()?;

    Ok(handle)
}

/// Fallback for processes where a recorder is already installed (tests).
pub fn recorder_handle() -> PrometheusHandle {
    setup_metrics().unwrap_or_else(|_| PrometheusBuilder::new().build_recorder().handle())
}

/// Sanitize a value for use as a Prometheus label value: anything outside
/// `[a-zA-Z0-9_]` becomes an underscore.
pub fn sanitize_label(label: &str) -> String {
    label
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// GET /metrics - Prometheus text exposition.
pub async fn handler(
    axum::extract::State(state): axum::extract::State<std::sync::Arc<crate::api::AppState>>,
) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics_handle.render(),
    )
}
