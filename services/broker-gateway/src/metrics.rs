//! Prometheus metrics exposition
//!
//! Gateway metrics:
//!
//! - `gateway_requests_total` (counter): labels `status`, `method`
//! - `gateway_request_duration_seconds` (histogram): label `status`
//! - `gateway_upstream_errors_total` (counter): label `error_type`
//! - `gateway_authorizations_total` (counter): label `outcome`
//!
//! The broker crate records `broker_token_refresh_total`,
//! `broker_sessions_active` and `broker_sessions_evicted_total` through the
//! same global recorder.

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Histogram buckets from 5ms to 60s, matching the upstream timeout range.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Builder with `gateway_request_duration_seconds` rendered as a histogram
/// (with `_bucket` lines for `histogram_quantile()`) rather than a summary.
fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("gateway_request_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .expect("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a completed gateway request with status code and HTTP method labels.
pub fn record_request(status: u16, method: &str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("gateway_requests_total", "status" => status_str.clone(), "method" => method.to_string())
        .increment(1);
    metrics::histogram!("gateway_request_duration_seconds", "status" => status_str)
        .record(duration_secs);
}

/// Record an upstream error with a classification label.
pub fn record_upstream_error(error_type: &str) {
    metrics::counter!("gateway_upstream_errors_total", "error_type" => error_type.to_string())
        .increment(1);
}

/// Record the outcome of an OAuth callback (`success`, `denied`, `csrf`, `exchange_failed`, ...).
pub fn record_authorization(outcome: &str) {
    metrics::counter!("gateway_authorizations_total", "outcome" => outcome.to_string())
        .increment(1);
}
