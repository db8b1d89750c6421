//! Metrics collection and export for Parlor.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use anyhow::{Context, Result};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "parlor_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "parlor_connections_active";
    pub const FRAMES_TOTAL: &str = "parlor_frames_total";
    pub const FRAMES_BYTES: &str = "parlor_frames_bytes";
    pub const FRAME_LATENCY_SECONDS: &str = "parlor_frame_latency_seconds";
    pub const ERRORS_TOTAL: &str = "parlor_errors_total";
}

/// Describe server and core metrics.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Frames received and sent");
    metrics::describe_counter!(names::FRAMES_BYTES, "Encoded bytes received and sent");
    metrics::describe_histogram!(
        names::FRAME_LATENCY_SECONDS,
        "Time spent handling one inbound frame"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Connection level errors by type");
    parlor_core::telemetry::describe();

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record one frame crossing the socket.
pub fn record_frame(bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction).increment(1);
    counter!(names::FRAMES_BYTES, "direction" => direction).increment(bytes as u64);
}

pub fn record_latency(seconds: f64) {
    histogram!(names::FRAME_LATENCY_SECONDS).record(seconds);
}

pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_guard() {
        let guard = ConnectionMetricsGuard::new();
        record_frame(12, "inbound");
        record_error("decode");
        drop(guard);
    }
}
