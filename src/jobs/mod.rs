//! Producer side of the work item status contract.
//!
//! A background job holds a [`WorkItemReporter`] and calls `report` as it
//! makes progress; the relay picks the status up from the bus.

use std::sync::Arc;

use crate::bus::{BusError, MessageBus};
use crate::events::{EventPayload, RelayEvent, WorkItemStatus};

pub struct WorkItemReporter {
    bus: Arc<dyn MessageBus>,
    tenant_id: Option<String>,
    work_item_id: Option<String>,
}

impl WorkItemReporter {
    pub fn new(bus: Arc<dyn MessageBus>, work_item_id: Option<String>) -> Self {
        Self {
            bus,
            tenant_id: None,
            work_item_id,
        }
    }

    /// Scope published statuses to one tenant's connections
    pub fn for_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn work_item_id(&self) -> Option<&str> {
        self.work_item_id.as_deref()
    }

    /// Publish progress (clamped to 0..=100) with an optional message
    pub async fn report(&self, progress: i32, message: Option<&str>) -> Result<(), BusError> {
        let status = WorkItemStatus::new(
            self.work_item_id.clone(),
            message.map(str::to_string),
            progress,
        );
        let payload = EventPayload::WorkItemStatus(status);
        let event = match &self.tenant_id {
            Some(tenant_id) => RelayEvent::for_tenant(tenant_id.clone(), payload),
            None => RelayEvent::global(payload),
        };
        self.bus.publish(&event).await
    }

    pub async fn complete(&self, message: Option<&str>) -> Result<(), BusError> {
        self.report(100, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::events::Topic;
    use tokio::sync::broadcast;

    #[tokio::test]
    async fn test_report_clamps_and_scopes() {
        let bus = Arc::new(InMemoryBus::default());
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let mut sub = bus
            .subscribe(Topic::WorkItemStatus, shutdown_rx)
            .await
            .unwrap();

        let reporter = WorkItemReporter::new(bus.clone(), Some("job-1".into())).for_tenant("org-1");
        reporter.report(150, Some("almost")).await.unwrap();
        reporter.report(-5, None).await.unwrap();

        let first = sub.recv().await.unwrap();
        assert_eq!(first.tenant_id.as_deref(), Some("org-1"));
        let EventPayload::WorkItemStatus(status) = first.payload else {
            panic!("expected status");
        };
        assert_eq!(status.progress, 100);
        assert_eq!(status.work_item_id.as_deref(), Some("job-1"));

        let second = sub.recv().await.unwrap();
        let EventPayload::WorkItemStatus(status) = second.payload else {
            panic!("expected status");
        };
        assert_eq!(status.progress, 0);
        assert!(status.message.is_none());
    }
}
