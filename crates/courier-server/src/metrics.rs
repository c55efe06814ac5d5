//! Metrics collection and export for Courier.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "courier_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "courier_connections_active";
    pub const EVENTS_TOTAL: &str = "courier_events_total";
    pub const EVENTS_RATE_LIMITED: &str = "courier_events_rate_limited_total";
    pub const AUTH_FAILURES: &str = "courier_auth_failures_total";
    pub const CALLS_TOTAL: &str = "courier_calls_total";
    pub const DISPATCH_SECONDS: &str = "courier_dispatch_seconds";
    pub const ERRORS_TOTAL: &str = "courier_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of socket connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active socket connections"
    );
    metrics::describe_counter!(names::EVENTS_TOTAL, "Total number of socket events processed");
    metrics::describe_counter!(
        names::EVENTS_RATE_LIMITED,
        "Total number of socket events dropped by rate limiting"
    );
    metrics::describe_counter!(names::AUTH_FAILURES, "Total number of rejected credentials");
    metrics::describe_counter!(names::CALLS_TOTAL, "Total number of call transitions");
    metrics::describe_histogram!(
        names::DISPATCH_SECONDS,
        "Inbound event dispatch latency in seconds"
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

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a processed socket event.
pub fn record_event(action: &'static str) {
    counter!(names::EVENTS_TOTAL, "action" => action).increment(1);
}

/// Record an event dropped by rate limiting.
pub fn record_rate_limited() {
    counter!(names::EVENTS_RATE_LIMITED).increment(1);
}

/// Record a rejected credential.
pub fn record_auth_failure() {
    counter!(names::AUTH_FAILURES).increment(1);
}

/// Record a call lifecycle transition.
pub fn record_call(transition: &'static str) {
    counter!(names::CALLS_TOTAL, "transition" => transition).increment(1);
}

/// Record dispatch latency.
pub fn record_dispatch_latency(seconds: f64) {
    histogram!(names::DISPATCH_SECONDS).record(seconds);
}

/// Record an error.
pub fn record_error(error_type: &str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type.to_string()).increment(1);
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
        // Just test that it doesn't panic
        let _guard = ConnectionMetricsGuard::new();
    }
}
