use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use crate::config::Settings;
use crate::events::Topic;

/// Maximum number of concurrent connection writes per event
pub const DEFAULT_MAX_CONCURRENT_SENDS: usize = 100;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Per-connection write timeout
    pub send_timeout: Duration,
    pub max_concurrent_sends: usize,
    /// Hold back entity changes for tenants over a plan ceiling
    pub suppress_over_limit_delivery: bool,
}

impl BrokerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            send_timeout: Duration::from_millis(settings.websocket.send_timeout_ms),
            max_concurrent_sends: DEFAULT_MAX_CONCURRENT_SENDS,
            suppress_over_limit_delivery: settings.quota.suppress_over_limit_delivery,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(2),
            max_concurrent_sends: DEFAULT_MAX_CONCURRENT_SENDS,
            suppress_over_limit_delivery: true,
        }
    }
}

/// Outcome of dispatching one event
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryResult {
    pub event_id: Uuid,
    pub topic: Topic,
    /// Connections that matched routing and topic filters
    pub targeted: usize,
    pub delivered: usize,
    /// Connections that failed or timed out and were removed
    pub failed: usize,
    /// Connections skipped because the tenant is over its plan limits
    pub suppressed: usize,
}

impl DeliveryResult {
    pub(crate) fn empty(event_id: Uuid, topic: Topic) -> Self {
        Self {
            event_id,
            topic,
            targeted: 0,
            delivered: 0,
            failed: 0,
            suppressed: 0,
        }
    }
}

#[derive(Debug, Default)]
pub struct BrokerStats {
    pub events_dispatched: AtomicU64,
    pub total_delivered: AtomicU64,
    pub total_failed: AtomicU64,
    pub total_suppressed: AtomicU64,
    pub connections_removed: AtomicU64,
}

impl BrokerStats {
    pub(crate) fn record(&self, result: &DeliveryResult) {
        self.events_dispatched.fetch_add(1, Ordering::Relaxed);
        self.total_delivered
            .fetch_add(result.delivered as u64, Ordering::Relaxed);
        self.total_failed
            .fetch_add(result.failed as u64, Ordering::Relaxed);
        self.total_suppressed
            .fetch_add(result.suppressed as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BrokerStatsSnapshot {
        BrokerStatsSnapshot {
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            total_delivered: self.total_delivered.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
            total_suppressed: self.total_suppressed.load(Ordering::Relaxed),
            connections_removed: self.connections_removed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BrokerStatsSnapshot {
    pub events_dispatched: u64,
    pub total_delivered: u64,
    pub total_failed: u64,
    pub total_suppressed: u64,
    pub connections_removed: u64,
}
