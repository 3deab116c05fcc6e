//! Metrics collection and export for Switchboard.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use switchboard_core::{RouteError, Routed};
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "switchboard_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "switchboard_connections_active";
    pub const REGISTRATIONS_TOTAL: &str = "switchboard_registrations_total";
    pub const IDENTITIES_REGISTERED: &str = "switchboard_identities_registered";
    pub const MESSAGES_TOTAL: &str = "switchboard_messages_total";
    pub const MESSAGES_BYTES: &str = "switchboard_messages_bytes";
    pub const ENVELOPES_ROUTED: &str = "switchboard_envelopes_routed_total";
    pub const ENVELOPES_DROPPED: &str = "switchboard_envelopes_dropped_total";
    pub const LATENCY_SECONDS: &str = "switchboard_latency_seconds";
    pub const ERRORS_TOTAL: &str = "switchboard_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(
        names::REGISTRATIONS_TOTAL,
        "Registration attempts by outcome"
    );
    metrics::describe_gauge!(
        names::IDENTITIES_REGISTERED,
        "Current number of registered identities"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of frames processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of frames processed");
    metrics::describe_counter!(names::ENVELOPES_ROUTED, "Envelopes forwarded, by kind");
    metrics::describe_counter!(names::ENVELOPES_DROPPED, "Envelopes dropped, by reason");
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Envelope handling latency in seconds"
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

/// Record a frame.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record envelope handling latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Record the result of handling one envelope.
pub fn record_outcome(result: &Result<Routed, RouteError>) {
    match result {
        Ok(Routed::Registered { .. }) => {
            counter!(names::REGISTRATIONS_TOTAL, "outcome" => "accepted").increment(1);
        }
        Ok(Routed::Delivered { kind, .. }) => {
            counter!(names::ENVELOPES_ROUTED, "kind" => kind.as_str()).increment(1);
        }
        Err(e @ RouteError::Rejected(_)) => {
            counter!(names::REGISTRATIONS_TOTAL, "outcome" => e.label()).increment(1);
        }
        Err(e) => {
            counter!(names::ENVELOPES_DROPPED, "reason" => e.label()).increment(1);
        }
    }
}

/// Update the registered identity count.
pub fn set_registered_identities(count: usize) {
    gauge!(names::IDENTITIES_REGISTERED).set(count as f64);
}

/// Record an error.
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
