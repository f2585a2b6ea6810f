//! Metrics collection and export for Parley.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "parley_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "parley_connections_active";
    pub const CONNECTIONS_REJECTED: &str = "parley_connections_rejected_total";
    pub const USERS_ONLINE: &str = "parley_users_online";
    pub const MESSAGES_TOTAL: &str = "parley_messages_total";
    pub const SIGNALS_TOTAL: &str = "parley_signals_total";
    pub const FRAMES_BYTES: &str = "parley_frames_bytes";
    pub const LATENCY_SECONDS: &str = "parley_latency_seconds";
    pub const ERRORS_TOTAL: &str = "parley_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of established connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of established connections"
    );
    metrics::describe_counter!(
        names::CONNECTIONS_REJECTED,
        "Connection attempts refused before upgrade, by reason"
    );
    metrics::describe_gauge!(names::USERS_ONLINE, "Users currently present");
    metrics::describe_counter!(
        names::MESSAGES_TOTAL,
        "Chat messages relayed, by outcome (delivered or dropped)"
    );
    metrics::describe_counter!(
        names::SIGNALS_TOTAL,
        "Call signals relayed, by kind and outcome"
    );
    metrics::describe_counter!(names::FRAMES_BYTES, "Total bytes of frames by direction");
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound event processing latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record an established connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a connection refused before upgrade.
pub fn record_rejection(reason: &'static str) {
    counter!(names::CONNECTIONS_REJECTED, "reason" => reason).increment(1);
}

/// Update the online user count.
pub fn set_online_users(count: usize) {
    gauge!(names::USERS_ONLINE).set(count as f64);
}

/// Record a relayed chat message.
pub fn record_relay(delivered: bool) {
    counter!(names::MESSAGES_TOTAL, "outcome" => outcome(delivered)).increment(1);
}

/// Record a relayed call signal.
pub fn record_signal(kind: &'static str, delivered: bool) {
    counter!(names::SIGNALS_TOTAL, "kind" => kind, "outcome" => outcome(delivered)).increment(1);
}

/// Record frame bytes.
pub fn record_bytes(bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record event processing latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

fn outcome(delivered: bool) -> &'static str {
    if delivered {
        "delivered"
    } else {
        "dropped"
    }
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
