//! Relay for background work item progress

use std::fmt;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::broker::{DeliveryResult, MessageBroker};
use crate::bus::{BusError, MessageBus, Subscription};
use crate::events::{EventPayload, RelayEvent, Topic};

/// Rendering of an absent value in log output
pub const NULL_PLACEHOLDER: &str = "<NULL>";

/// Displays an optional value, or [`NULL_PLACEHOLDER`] when absent
pub struct OrNull<'a, T>(pub &'a Option<T>);

impl<T: fmt::Display> fmt::Display for OrNull<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(value) => value.fmt(f),
            None => f.write_str(NULL_PLACEHOLDER),
        }
    }
}

/// Consumes `work-item-status` events, traces them and pushes them to
/// subscribed clients through the broker.
pub struct StatusRelay {
    broker: Arc<MessageBroker>,
}

impl StatusRelay {
    pub fn new(broker: Arc<MessageBroker>) -> Self {
        Self { broker }
    }

    /// Subscribe to the status topic and spawn the relay loop
    pub async fn start(
        self: Arc<Self>,
        bus: &dyn MessageBus,
        shutdown: &broadcast::Sender<()>,
    ) -> Result<JoinHandle<()>, BusError> {
        let subscription = bus
            .subscribe(Topic::WorkItemStatus, shutdown.subscribe())
            .await?;
        tracing::info!("Work item status relay started");
        Ok(tokio::spawn(async move { self.run(subscription).await }))
    }

    pub async fn run(&self, mut subscription: Subscription) {
        while let Some(event) = subscription.recv().await {
            self.handle(&event).await;
        }
        tracing::info!("Work item status relay stopped");
    }

    /// Returns `None` when the event is not a status report
    pub async fn handle(&self, event: &RelayEvent) -> Option<DeliveryResult> {
        let EventPayload::WorkItemStatus(status) = &event.payload else {
            tracing::warn!(
                event_id = %event.id,
                topic = %event.topic(),
                "Dropping non-status event received on the status topic"
            );
            return None;
        };

        tracing::trace!(
            "WorkItem Status: id={} message={} progress={}",
            OrNull(&status.work_item_id),
            OrNull(&status.message),
            status.progress
        );

        Some(self.broker.dispatch(event).await)
    }
}
