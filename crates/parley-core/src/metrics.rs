//! Metrics instrumentation for Parley.
//!
//! Recording goes through the `metrics` facade; nothing is exported unless
//! the embedding binary installs a recorder.

use metrics::{counter, gauge};

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "parley_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "parley_connections_active";
    pub const MESSAGES_TOTAL: &str = "parley_messages_total";
    pub const MESSAGES_BYTES: &str = "parley_messages_bytes";
    pub const LOG_LENGTH: &str = "parley_log_length";
    pub const DELIVERY_FAILURES_TOTAL: &str = "parley_delivery_failures_total";
    pub const ERRORS_TOTAL: &str = "parley_errors_total";
}

/// Describe every metric so exporters can publish help text.
pub fn describe() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of connection handlers"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of frames processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total payload bytes processed");
    metrics::describe_gauge!(names::LOG_LENGTH, "Number of messages in the chat history");
    metrics::describe_counter!(
        names::DELIVERY_FAILURES_TOTAL,
        "Broadcast deliveries that failed and pruned a connection"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");
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

/// Record a message.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Update the history length.
pub fn set_log_length(len: u64) {
    gauge!(names::LOG_LENGTH).set(len as f64);
}

/// Record failed broadcast deliveries.
pub fn record_delivery_failures(count: usize) {
    if count > 0 {
        counter!(names::DELIVERY_FAILURES_TOTAL).increment(count as u64);
    }
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
