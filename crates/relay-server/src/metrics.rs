//! Metrics collection and export for the relay server.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const SESSIONS_TOTAL: &str = "relay_sessions_total";
    pub const SESSIONS_ACTIVE: &str = "relay_sessions_active";
    pub const MESSAGES_TOTAL: &str = "relay_messages_total";
    pub const MESSAGES_BYTES: &str = "relay_messages_bytes";
    pub const PUBLISHED_TOTAL: &str = "relay_published_total";
    pub const TOPICS_ACTIVE: &str = "relay_topics_active";
    pub const SUBSCRIPTIONS_TOTAL: &str = "relay_subscriptions_total";
    pub const LATENCY_SECONDS: &str = "relay_latency_seconds";
    pub const ERRORS_TOTAL: &str = "relay_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::SESSIONS_TOTAL,
        "Total number of client sessions since server start"
    );
    metrics::describe_gauge!(names::SESSIONS_ACTIVE, "Current number of client sessions");
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of client frames");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of client frames");
    metrics::describe_counter!(
        names::PUBLISHED_TOTAL,
        "Total number of events published to the bus"
    );
    metrics::describe_gauge!(
        names::TOPICS_ACTIVE,
        "Current number of topics with a bus listener"
    );
    metrics::describe_counter!(
        names::SUBSCRIPTIONS_TOTAL,
        "Total number of destination subscriptions"
    );
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound frame handling latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a frame exchanged with a client.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record an event published to the bus.
pub fn record_published(kind: &'static str) {
    counter!(names::PUBLISHED_TOTAL, "type" => kind).increment(1);
}

/// Record inbound frame handling latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Record a subscription.
pub fn record_subscription() {
    counter!(names::SUBSCRIPTIONS_TOTAL).increment(1);
}

/// Update active topic count.
pub fn set_active_topics(count: usize) {
    gauge!(names::TOPICS_ACTIVE).set(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Records a session on creation and its end on drop.
pub struct SessionMetricsGuard;

impl SessionMetricsGuard {
    /// Create a new metrics guard, recording a session.
    #[must_use]
    pub fn new() -> Self {
        counter!(names::SESSIONS_TOTAL).increment(1);
        gauge!(names::SESSIONS_ACTIVE).increment(1.0);
        Self
    }
}

impl Default for SessionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SessionMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::SESSIONS_ACTIVE).decrement(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_exporter() {
        // No recorder installed: every call is a no-op.
        let _guard = SessionMetricsGuard::new();
        record_message(12, "inbound");
        record_published("summary");
        set_active_topics(3);
        record_error("websocket");
    }
}
