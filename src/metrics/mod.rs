//! Prometheus metrics for the event relay.
//!
//! - Connection metrics (active connections, unique users)
//! - Delivery metrics (targeted, delivered, failed, suppressed per topic)
//! - Bus metrics (received events, resubscriptions)
//! - Guard metrics (throttling decisions, overage notices)

mod helpers;

pub use helpers::{
    encode_metrics, BusMetrics, ConnectionMetrics, DeliveryMetrics, GuardMetrics,
    HeartbeatMetrics, WsMessageMetrics,
};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "relay";

lazy_static! {
    // ============================================================================
    // Connection Metrics
    // ============================================================================

    /// Total number of active WebSocket connections
    pub static ref CONNECTIONS_TOTAL: IntGauge = register_int_gauge!(
        format!("{}_connections_total", METRIC_PREFIX),
        "Total number of active WebSocket connections"
    ).unwrap();

    /// Number of unique connected users
    pub static ref USERS_CONNECTED: IntGauge = register_int_gauge!(
        format!("{}_users_connected", METRIC_PREFIX),
        "Number of unique connected users"
    ).unwrap();

    pub static ref WS_CONNECTIONS_OPENED: IntCounter = register_int_counter!(
        format!("{}_ws_connections_opened_total", METRIC_PREFIX),
        "Total WebSocket connections opened"
    ).unwrap();

    pub static ref WS_CONNECTIONS_CLOSED: IntCounter = register_int_counter!(
        format!("{}_ws_connections_closed_total", METRIC_PREFIX),
        "Total WebSocket connections closed"
    ).unwrap();

    /// Connections refused at registration (duplicate id or limits)
    pub static ref WS_CONNECTIONS_REJECTED: IntCounterVec = register_int_counter_vec!(
        format!("{}_ws_connections_rejected_total", METRIC_PREFIX),
        "Total WebSocket connections refused by the registry",
        &["reason"]
    ).unwrap();

    /// WebSocket messages received from clients
    pub static ref WS_MESSAGES_RECEIVED: IntCounterVec = register_int_counter_vec!(
        format!("{}_ws_messages_received_total", METRIC_PREFIX),
        "Total WebSocket messages received from clients",
        &["type"]
    ).unwrap();

    /// WebSocket connection duration
    pub static ref WS_CONNECTION_DURATION: Histogram = register_histogram!(
        format!("{}_ws_connection_duration_seconds", METRIC_PREFIX),
        "WebSocket connection duration in seconds",
        vec![1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0, 1800.0, 3600.0]
    ).unwrap();

    // ============================================================================
    // Delivery Metrics
    // ============================================================================

    /// Events dispatched by the broker, per topic
    pub static ref EVENTS_DISPATCHED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_events_dispatched_total", METRIC_PREFIX),
        "Total events dispatched by the broker",
        &["topic"]
    ).unwrap();

    pub static ref DELIVERIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_deliveries_total", METRIC_PREFIX),
        "Total per-connection delivery outcomes",
        &["topic", "outcome"]
    ).unwrap();

    /// Fan-out latency (time from dispatch start to last connection write)
    pub static ref DISPATCH_LATENCY: HistogramVec = register_histogram_vec!(
        format!("{}_dispatch_latency_seconds", METRIC_PREFIX),
        "Event fan-out latency in seconds",
        &["topic"],
        vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]
    ).unwrap();

    // ============================================================================
    // Bus Metrics
    // ============================================================================

    pub static ref BUS_EVENTS_RECEIVED: IntCounterVec = register_int_counter_vec!(
        format!("{}_bus_events_received_total", METRIC_PREFIX),
        "Total events received from the bus",
        &["topic"]
    ).unwrap();

    pub static ref BUS_EVENTS_PUBLISHED: IntCounterVec = register_int_counter_vec!(
        format!("{}_bus_events_published_total", METRIC_PREFIX),
        "Total events published to the bus",
        &["topic"]
    ).unwrap();

    /// Total resubscription attempts after a dropped bus connection
    pub static ref BUS_RECONNECTIONS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_bus_reconnections_total", METRIC_PREFIX),
        "Total bus resubscription attempts"
    ).unwrap();

    // ============================================================================
    // Guard Metrics
    // ============================================================================

    pub static ref GUARD_REJECTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_guard_rejected_total", METRIC_PREFIX),
        "Total requests rejected by a guard",
        &["guard"]
    ).unwrap();

    pub static ref GUARD_ADMITTED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_guard_admitted_total", METRIC_PREFIX),
        "Total requests admitted by the guard pipeline"
    ).unwrap();

    /// Plan-overage notices emitted on a rising edge
    pub static ref OVERAGE_NOTICES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_overage_notices_total", METRIC_PREFIX),
        "Total plan-overage notices emitted",
        &["window"]
    ).unwrap();

    // ============================================================================
    // Heartbeat Metrics
    // ============================================================================

    /// Heartbeat round duration in milliseconds
    pub static ref HEARTBEAT_DURATION_MS: Histogram = register_histogram!(
        format!("{}_heartbeat_duration_ms", METRIC_PREFIX),
        "Heartbeat round duration in milliseconds",
        vec![10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0]
    ).unwrap();

    pub static ref HEARTBEAT_TIMEOUTS: IntCounter = register_int_counter!(
        format!("{}_heartbeat_timeouts_total", METRIC_PREFIX),
        "Total heartbeat send timeouts"
    ).unwrap();

    pub static ref STALE_CONNECTIONS_CLEANED: IntCounter = register_int_counter!(
        format!("{}_stale_connections_cleaned_total", METRIC_PREFIX),
        "Total idle connections closed by the cleanup task"
    ).unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_metrics() {
        CONNECTIONS_TOTAL.set(1);

        let output = encode_metrics().unwrap();
        assert!(output.contains("relay_connections_total"));
    }

    #[test]
    fn test_connection_metrics() {
        CONNECTIONS_TOTAL.set(100);
        USERS_CONNECTED.set(50);
        WS_CONNECTION_DURATION.observe(12.0);
        // Just verify no panics
    }
}
