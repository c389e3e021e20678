//! Routes bus events to the WebSocket connections entitled to them.
//!
//! One dispatch loop runs per topic subscription, so events of a topic are
//! handled in arrival order while different topics proceed concurrently.

mod types;

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::bus::{BusError, MessageBus, Subscription};
use crate::connection_manager::{ConnectionHandle, ConnectionRegistry};
use crate::events::{
    EventPayload, MembershipChange, RelayEvent, Topic, UserMembershipChanged, USER_ENTITY_TYPE,
};
use crate::guards::QuotaTracker;
use crate::metrics::DeliveryMetrics;
use crate::websocket::{OutboundMessage, ServerMessage};

pub use types::{
    BrokerConfig, BrokerStats, BrokerStatsSnapshot, DeliveryResult, DEFAULT_MAX_CONCURRENT_SENDS,
};

/// Topics dispatched by the generic broker loops. Work item status has its
/// own relay.
pub fn broker_topics() -> Vec<Topic> {
    Topic::ALL
        .into_iter()
        .filter(|t| *t != Topic::WorkItemStatus)
        .collect()
}

pub struct MessageBroker {
    registry: Arc<ConnectionRegistry>,
    quota: Arc<QuotaTracker>,
    config: BrokerConfig,
    stats: BrokerStats,
}

impl MessageBroker {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        quota: Arc<QuotaTracker>,
        config: BrokerConfig,
    ) -> Self {
        Self {
            registry,
            quota,
            config,
            stats: BrokerStats::default(),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> BrokerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Subscribe to every topic and spawn one dispatch loop per subscription.
    /// Fails if any subscription cannot be established.
    pub async fn start(
        self: &Arc<Self>,
        bus: &dyn MessageBus,
        topics: &[Topic],
        shutdown: &broadcast::Sender<()>,
    ) -> Result<Vec<JoinHandle<()>>, BusError> {
        let mut handles = Vec::with_capacity(topics.len());
        for topic in topics {
            let subscription = bus.subscribe(*topic, shutdown.subscribe()).await?;
            let broker = self.clone();
            handles.push(tokio::spawn(async move { broker.run(subscription).await }));
        }

        tracing::info!(
            backend = bus.backend_name(),
            topics = topics.len(),
            "Message broker started"
        );
        Ok(handles)
    }

    /// Dispatch events until the subscription closes and is drained
    pub async fn run(&self, mut subscription: Subscription) {
        let topic = subscription.topic();
        tracing::debug!(topic = %topic, "Dispatch loop started");

        while let Some(event) = subscription.recv().await {
            self.dispatch(&event).await;
        }

        tracing::info!(topic = %topic, "Dispatch loop stopped");
    }

    #[tracing::instrument(
        name = "broker.dispatch",
        skip(self, event),
        fields(event_id = %event.id, topic = %event.topic(), tenant_id = ?event.tenant_id)
    )]
    pub async fn dispatch(&self, event: &RelayEvent) -> DeliveryResult {
        let start = Instant::now();
        let topic = event.topic();
        DeliveryMetrics::record_dispatched(topic);

        if let EventPayload::UserMembershipChanged(change) = &event.payload {
            self.apply_membership(change).await;
        }

        let mut result = DeliveryResult::empty(event.id, topic);

        let mut targets = Vec::new();
        for conn in self.resolve_targets(event).await {
            if conn.accepts(topic).await {
                targets.push(conn);
            }
        }
        result.targeted = targets.len();

        if targets.is_empty() {
            tracing::trace!("No connections to deliver to");
            self.stats.record(&result);
            return result;
        }

        if self.is_suppressed(event) {
            result.suppressed = targets.len();
            tracing::debug!(
                suppressed = result.suppressed,
                "Tenant over plan limit, entity change not delivered"
            );
            self.finish(&result, start);
            return result;
        }

        let outbound = match OutboundMessage::preserialized(&ServerMessage::event(event.clone())) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize event");
                self.stats.record(&result);
                return result;
            }
        };

        let (delivered, failed) = self.send_to_connections(targets, outbound).await;
        result.delivered = delivered;
        result.failed = failed.len();

        for conn in failed {
            tracing::warn!(
                connection_id = %conn.id,
                user_id = %conn.user_id,
                "Delivery failed, removing connection"
            );
            conn.close();
            if self.registry.remove(conn.id).await.is_some() {
                self.stats.connections_removed.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.finish(&result, start);
        result
    }

    fn finish(&self, result: &DeliveryResult, start: Instant) {
        self.stats.record(result);
        DeliveryMetrics::record_outcomes(
            result.topic,
            result.delivered as u64,
            result.failed as u64,
            result.suppressed as u64,
        );
        DeliveryMetrics::record_latency(result.topic, start.elapsed().as_secs_f64());

        tracing::debug!(
            targeted = result.targeted,
            delivered = result.delivered,
            failed = result.failed,
            suppressed = result.suppressed,
            "Dispatched event"
        );
    }

    async fn apply_membership(&self, change: &UserMembershipChanged) {
        let affected = match change.change_type {
            MembershipChange::Added => {
                self.registry
                    .add_membership(&change.user_id, &change.organization_id)
                    .await
            }
            MembershipChange::Removed => {
                self.registry
                    .remove_membership(&change.user_id, &change.organization_id)
                    .await
            }
        };

        tracing::debug!(
            user_id = %change.user_id,
            organization_id = %change.organization_id,
            change = ?change.change_type,
            connections = affected,
            "Applied membership change"
        );
    }

    fn is_suppressed(&self, event: &RelayEvent) -> bool {
        if !self.config.suppress_over_limit_delivery {
            return false;
        }
        match (&event.payload, event.tenant_id.as_deref()) {
            (EventPayload::EntityChanged(_), Some(tenant_id)) => self.quota.is_over(tenant_id),
            _ => false,
        }
    }

    /// Connections an event is routed to, before topic filtering
    async fn resolve_targets(&self, event: &RelayEvent) -> Vec<Arc<ConnectionHandle>> {
        match &event.payload {
            // The changed user learns about it on every connection
            EventPayload::EntityChanged(changed)
                if changed.entity_type == USER_ENTITY_TYPE && event.user_id.is_none() =>
            {
                if let Some(user_id) = changed.id.as_deref() {
                    return self.registry.get_connections_for_user(user_id).await;
                }
            }
            // Both the organization and the affected user, who may just have
            // been removed from it
            EventPayload::UserMembershipChanged(change) => {
                let mut seen = HashSet::new();
                let mut targets = self
                    .registry
                    .get_connections(&change.organization_id)
                    .await;
                targets.retain(|c| seen.insert(c.id));
                for conn in self.registry.get_connections_for_user(&change.user_id).await {
                    if seen.insert(conn.id) {
                        targets.push(conn);
                    }
                }
                return targets;
            }
            _ => {}
        }

        match (event.tenant_id.as_deref(), event.user_id.as_deref()) {
            (Some(tenant_id), Some(user_id)) => {
                self.registry.get_user_connections(tenant_id, user_id).await
            }
            (Some(tenant_id), None) => self.registry.get_connections(tenant_id).await,
            (None, Some(user_id)) => self.registry.get_connections_for_user(user_id).await,
            (None, None) => self.registry.get_all_connections().await,
        }
    }

    /// Write one shared frame to every target with bounded concurrency.
    /// Returns the delivered count and the connections that failed.
    async fn send_to_connections(
        &self,
        connections: Vec<Arc<ConnectionHandle>>,
        outbound: OutboundMessage,
    ) -> (usize, Vec<Arc<ConnectionHandle>>) {
        let send_timeout = self.config.send_timeout;
        let max_concurrent = self.config.max_concurrent_sends.max(1);

        let mut futures = FuturesUnordered::new();
        let mut delivered = 0;
        let mut failed = Vec::new();

        for conn in connections {
            let msg = outbound.clone();
            futures.push(async move {
                let outcome = tokio::time::timeout(send_timeout, conn.send_preserialized(msg)).await;
                match outcome {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(_)) | Err(_) => Err(conn),
                }
            });

            // Process completed futures when we hit the concurrency limit
            while futures.len() >= max_concurrent {
                match futures.next().await {
                    Some(Ok(())) => delivered += 1,
                    Some(Err(conn)) => failed.push(conn),
                    None => break,
                }
            }
        }

        while let Some(result) = futures.next().await {
            match result {
                Ok(()) => delivered += 1,
                Err(conn) => failed.push(conn),
            }
        }

        (delivered, failed)
    }
}
