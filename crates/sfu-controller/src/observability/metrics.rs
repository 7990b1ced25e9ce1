//! Metrics definitions for the SFU Controller per ADR-0011.
//!
//! All metrics follow Prometheus naming conventions:
//! - `sfu_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded by code, never by client input:
//! - `method`: signaling methods (8 values) plus `invalid`
//! - `status`: `success` or an error code (~13 values)
//! - `operation`: media engine operations (9 values)
//! - `kind`: `failure` or `timeout`
//! - `actor_type`: `registry` or `room`

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Signaling round trips include one or more engine calls
        .set_buckets_for_metric(
            Matcher::Prefix("sfu_request".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000,
            ],
        )
        .map_err(|e| format!("Failed to set request latency buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Prefix("sfu_engine".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 5.000, 10.000,
            ],
        )
        .map_err(|e| format!("Failed to set engine latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Registry Gauges
// ============================================================================

/// Metric: `sfu_rooms_active`
pub fn set_rooms_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_rooms_active").set(count as f64);
}

/// Metric: `sfu_peers_active`
pub fn set_peers_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_peers_active").set(count as f64);
}

/// Metric: `sfu_connections_active`
///
/// Open signaling WebSocket connections.
pub fn set_connections_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_connections_active").set(count as f64);
}

// ============================================================================
// Signaling
// ============================================================================

/// Record one handled signaling request.
///
/// Metrics: `sfu_request_latency_seconds{method}`, `sfu_requests_total{method,status}`
pub fn record_request(method: &'static str, status: &'static str, duration: Duration) {
    histogram!("sfu_request_latency_seconds", "method" => method).record(duration.as_secs_f64());
    counter!("sfu_requests_total", "method" => method, "status" => status).increment(1);
}

/// Record a `newProducer` notification that could not be queued for a peer.
///
/// Metric: `sfu_broadcast_dropped_total`
pub fn record_broadcast_dropped() {
    counter!("sfu_broadcast_dropped_total").increment(1);
}

// ============================================================================
// Media Engine
// ============================================================================

/// Metric: `sfu_engine_latency_seconds{operation}`
pub fn record_engine_latency(operation: &'static str, duration: Duration) {
    histogram!("sfu_engine_latency_seconds", "operation" => operation)
        .record(duration.as_secs_f64());
}

/// Metric: `sfu_engine_errors_total{operation,kind}`
pub fn record_engine_error(operation: &'static str, kind: &'static str) {
    counter!("sfu_engine_errors_total", "operation" => operation, "kind" => kind).increment(1);
}

// ============================================================================
// Actors
// ============================================================================

/// Record an actor panic event.
///
/// Metric: `sfu_actor_panics_total{actor_type}`
///
/// ALERT: Any non-zero value indicates a bug and should trigger investigation.
pub fn record_actor_panic(actor_type: &'static str) {
    counter!("sfu_actor_panics_total", "actor_type" => actor_type).increment(1);
}
