//! Metrics helper structs for convenient metric recording

use prometheus::{Encoder, TextEncoder};

use crate::events::Topic;

use super::{
    BUS_EVENTS_PUBLISHED, BUS_EVENTS_RECEIVED, BUS_RECONNECTIONS_TOTAL, CONNECTIONS_TOTAL,
    DELIVERIES_TOTAL, DISPATCH_LATENCY, EVENTS_DISPATCHED_TOTAL, GUARD_ADMITTED_TOTAL,
    GUARD_REJECTED_TOTAL, HEARTBEAT_DURATION_MS, HEARTBEAT_TIMEOUTS, OVERAGE_NOTICES_TOTAL,
    STALE_CONNECTIONS_CLEANED, USERS_CONNECTED, WS_CONNECTIONS_CLOSED, WS_CONNECTIONS_OPENED,
    WS_CONNECTIONS_REJECTED, WS_CONNECTION_DURATION, WS_MESSAGES_RECEIVED,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

pub struct ConnectionMetrics;

impl ConnectionMetrics {
    pub fn record_opened() {
        WS_CONNECTIONS_OPENED.inc();
    }

    /// Record a closed connection and how long it lived
    pub fn record_closed(duration_secs: f64) {
        WS_CONNECTIONS_CLOSED.inc();
        WS_CONNECTION_DURATION.observe(duration_secs);
    }

    pub fn record_rejected(reason: &str) {
        WS_CONNECTIONS_REJECTED.with_label_values(&[reason]).inc();
    }

    /// Refresh the connection gauges from a registry snapshot
    pub fn set_current(connections: usize, users: usize) {
        CONNECTIONS_TOTAL.set(connections as i64);
        USERS_CONNECTED.set(users as i64);
    }
}

/// Helper struct for recording broker delivery metrics
pub struct DeliveryMetrics;

impl DeliveryMetrics {
    pub fn record_dispatched(topic: Topic) {
        EVENTS_DISPATCHED_TOTAL
            .with_label_values(&[topic.as_str()])
            .inc();
    }

    pub fn record_outcomes(topic: Topic, delivered: u64, failed: u64, suppressed: u64) {
        let t = topic.as_str();
        if delivered > 0 {
            DELIVERIES_TOTAL
                .with_label_values(&[t, "delivered"])
                .inc_by(delivered);
        }
        if failed > 0 {
            DELIVERIES_TOTAL
                .with_label_values(&[t, "failed"])
                .inc_by(failed);
        }
        if suppressed > 0 {
            DELIVERIES_TOTAL
                .with_label_values(&[t, "suppressed"])
                .inc_by(suppressed);
        }
    }

    pub fn record_latency(topic: Topic, latency_secs: f64) {
        DISPATCH_LATENCY
            .with_label_values(&[topic.as_str()])
            .observe(latency_secs);
    }
}

pub struct BusMetrics;

impl BusMetrics {
    pub fn record_received(topic: Topic) {
        BUS_EVENTS_RECEIVED.with_label_values(&[topic.as_str()]).inc();
    }

    pub fn record_published(topic: Topic) {
        BUS_EVENTS_PUBLISHED
            .with_label_values(&[topic.as_str()])
            .inc();
    }

    pub fn record_reconnect() {
        BUS_RECONNECTIONS_TOTAL.inc();
    }
}

/// Helper struct for guard pipeline metrics
pub struct GuardMetrics;

impl GuardMetrics {
    pub fn record_admitted() {
        GUARD_ADMITTED_TOTAL.inc();
    }

    pub fn record_unauthorized() {
        GUARD_REJECTED_TOTAL.with_label_values(&["api_key"]).inc();
    }

    pub fn record_throttled() {
        GUARD_REJECTED_TOTAL.with_label_values(&["throttling"]).inc();
    }

    /// Record a rising-edge overage notice
    pub fn record_overage_notice(is_hourly: bool) {
        let window = if is_hourly { "hourly" } else { "monthly" };
        OVERAGE_NOTICES_TOTAL.with_label_values(&[window]).inc();
    }
}

/// Helper struct for heartbeat metrics
pub struct HeartbeatMetrics;

impl HeartbeatMetrics {
    /// Record heartbeat round duration
    pub fn record_duration_ms(duration_ms: u64) {
        HEARTBEAT_DURATION_MS.observe(duration_ms as f64);
    }

    /// Record heartbeat timeouts
    pub fn record_timeouts(count: u64) {
        HEARTBEAT_TIMEOUTS.inc_by(count);
    }

    pub fn record_stale_cleaned(count: usize) {
        STALE_CONNECTIONS_CLEANED.inc_by(count as u64);
    }
}

/// Helper struct for recording WebSocket message metrics
pub struct WsMessageMetrics;

impl WsMessageMetrics {
    pub fn record_subscribe() {
        WS_MESSAGES_RECEIVED.with_label_values(&["subscribe"]).inc();
    }

    pub fn record_unsubscribe() {
        WS_MESSAGES_RECEIVED
            .with_label_values(&["unsubscribe"])
            .inc();
    }

    pub fn record_ping() {
        WS_MESSAGES_RECEIVED.with_label_values(&["ping"]).inc();
    }

    pub fn record_invalid() {
        WS_MESSAGES_RECEIVED.with_label_values(&["invalid"]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_metrics() {
        DeliveryMetrics::record_dispatched(Topic::EntityChanged);
        DeliveryMetrics::record_outcomes(Topic::EntityChanged, 5, 1, 0);
        DeliveryMetrics::record_latency(Topic::EntityChanged, 0.002);

        let output = encode_metrics().unwrap();
        assert!(output.contains("relay_deliveries_total"));
        assert!(output.contains("entity-changed"));
    }

    #[test]
    fn test_guard_metrics() {
        GuardMetrics::record_admitted();
        GuardMetrics::record_unauthorized();
        GuardMetrics::record_throttled();
        GuardMetrics::record_overage_notice(true);
        GuardMetrics::record_overage_notice(false);
        // Just verify no panics
    }

    #[test]
    fn test_ws_message_metrics() {
        WsMessageMetrics::record_subscribe();
        WsMessageMetrics::record_unsubscribe();
        WsMessageMetrics::record_ping();
        WsMessageMetrics::record_invalid();
        // Just verify no panics
    }
}
