//! Metrics collection and export for Trailcast.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use anyhow::{Context, Result};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;
use trailcast_core::{ProcessStatus, RelayMetrics};

/// Metric names.
pub mod names {
    pub const POSITIONS_PROCESSED_TOTAL: &str = "trailcast_positions_processed_total";
    pub const PROCESSING_LATENCY_SECONDS: &str = "trailcast_processing_latency_seconds";
    pub const ACTIVE_RUNNERS: &str = "active_runners";
    pub const ACTIVE_RUNNERS_BY_TRAIL: &str = "active_runners_by_trail";
    pub const DELIVERY_FAILURES_TOTAL: &str = "trailcast_delivery_failures_total";
    pub const BROKER_RECONNECTS_TOTAL: &str = "trailcast_broker_reconnects_total";
    pub const VIEWERS_TOTAL: &str = "trailcast_viewers_total";
    pub const VIEWERS_ACTIVE: &str = "trailcast_viewers_active";
}

/// Describe every series on the installed recorder.
///
/// Call after [`start_metrics_server`]; descriptions sent earlier are lost.
pub fn init_metrics() {
    // Describe metrics
    metrics::describe_counter!(
        names::POSITIONS_PROCESSED_TOTAL,
        "Total number of position messages processed, by status"
    );
    metrics::describe_histogram!(
        names::PROCESSING_LATENCY_SECONDS,
        "Message processing latency in seconds"
    );
    metrics::describe_gauge!(
        names::ACTIVE_RUNNERS,
        "Runners seen within the presence TTL"
    );
    metrics::describe_gauge!(
        names::ACTIVE_RUNNERS_BY_TRAIL,
        "Runners seen within the presence TTL, per trail"
    );
    metrics::describe_counter!(
        names::DELIVERY_FAILURES_TOTAL,
        "Deliveries that could not be handed to a viewer"
    );
    metrics::describe_counter!(names::BROKER_RECONNECTS_TOTAL, "Broker reconnect attempts");
    metrics::describe_counter!(
        names::VIEWERS_TOTAL,
        "Total number of viewer connections since server start"
    );
    metrics::describe_gauge!(
        names::VIEWERS_ACTIVE,
        "Current number of viewer connections"
    );

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(addr: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("Failed to start metrics server on {addr}"))?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Relay metrics backed by the global `metrics` recorder.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusMetrics;

impl RelayMetrics for PrometheusMetrics {
    fn record_processed(&self, status: ProcessStatus) {
        counter!(names::POSITIONS_PROCESSED_TOTAL, "status" => status.as_str()).increment(1);
    }

    fn record_processing_time(&self, elapsed: Duration) {
        histogram!(names::PROCESSING_LATENCY_SECONDS).record(elapsed.as_secs_f64());
    }

    fn set_active_runners(&self, count: usize) {
        gauge!(names::ACTIVE_RUNNERS).set(count as f64);
    }

    fn set_active_runners_for_trail(&self, trail: &str, count: usize) {
        gauge!(names::ACTIVE_RUNNERS_BY_TRAIL, "trail" => trail.to_string()).set(count as f64);
    }

    fn record_delivery_failure(&self) {
        counter!(names::DELIVERY_FAILURES_TOTAL).increment(1);
    }

    fn record_broker_reconnect(&self) {
        counter!(names::BROKER_RECONNECTS_TOTAL).increment(1);
    }
}

/// Record a new viewer.
pub fn record_viewer_connected() {
    counter!(names::VIEWERS_TOTAL).increment(1);
    gauge!(names::VIEWERS_ACTIVE).increment(1.0);
}

/// Record a viewer leaving.
pub fn record_viewer_disconnected() {
    gauge!(names::VIEWERS_ACTIVE).decrement(1.0);
}

/// Metrics guard that records disconnection on drop.
pub struct ViewerMetricsGuard;

impl ViewerMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_viewer_connected();
        Self
    }
}

impl Default for ViewerMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ViewerMetricsGuard {
    fn drop(&mut self) {
        record_viewer_disconnected();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_guard() {
        // No recorder installed; just check it doesn't panic
        let _guard = ViewerMetricsGuard::new();
    }

    #[test]
    fn test_relay_metrics_without_recorder() {
        let metrics = PrometheusMetrics;
        metrics.record_processed(ProcessStatus::Success);
        metrics.record_processed(ProcessStatus::Error);
        metrics.record_processing_time(Duration::from_millis(3));
        metrics.set_active_runners(2);
        metrics.set_active_runners_for_trail("pr9", 2);
    }

    #[test]
    fn test_prometheus_exposition() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            init_metrics();
            let metrics = PrometheusMetrics;
            metrics.record_processed(ProcessStatus::Success);
            metrics.record_processed(ProcessStatus::Error);
            metrics.record_processing_time(Duration::from_millis(3));
            metrics.set_active_runners(1);
            metrics.set_active_runners_for_trail("pr9", 1);
        });

        let output = handle.render();
        assert!(output.contains(r#"trailcast_positions_processed_total{status="success"} 1"#));
        assert!(output.contains(r#"trailcast_positions_processed_total{status="error"} 1"#));
        assert!(output.contains(r#"active_runners_by_trail{trail="pr9"} 1"#));
        assert!(output.contains("active_runners 1"));
        assert!(output.contains("trailcast_processing_latency_seconds"));
        assert!(output.contains("# HELP trailcast_positions_processed_total Total number"));
        assert!(output.contains("# HELP active_runners_by_trail"));
    }
}
