//! Plan overage accounting and notification

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::bus::MessageBus;
use crate::events::{EventPayload, PlanOverageNotice, RelayEvent};
use crate::metrics::GuardMetrics;

use super::api_key::TenantContext;
use super::quota::{OverageStatus, QuotaTracker};

/// Records admitted requests against the tenant's quota.
///
/// Never rejects: the request is marked with its overage status and crossing
/// a ceiling hands one notice to the notifier.
pub struct OverageGuard {
    tracker: Arc<QuotaTracker>,
    notices: mpsc::UnboundedSender<PlanOverageNotice>,
}

impl OverageGuard {
    pub fn new(
        tracker: Arc<QuotaTracker>,
    ) -> (Self, mpsc::UnboundedReceiver<PlanOverageNotice>) {
        let (notices, rx) = mpsc::unbounded_channel();
        (Self { tracker, notices }, rx)
    }

    pub fn tracker(&self) -> &Arc<QuotaTracker> {
        &self.tracker
    }

    pub fn check(&self, tenant: &TenantContext) -> OverageStatus {
        let update = self.tracker.record(&tenant.tenant_id, 1);

        for notice in update.crossed {
            tracing::info!(
                tenant_id = %notice.organization_id,
                is_hourly = notice.is_hourly,
                count = notice.count,
                limit = notice.limit,
                "Tenant exceeded plan limit"
            );
            GuardMetrics::record_overage_notice(notice.is_hourly);
            if self.notices.send(notice).is_err() {
                tracing::warn!(tenant_id = %tenant.tenant_id, "Overage notifier is not running");
            }
        }

        update.status
    }
}

/// Publishes overage notices on the bus as tenant-scoped `plan-overage`
/// events.
pub struct OverageNotifier {
    bus: Arc<dyn MessageBus>,
}

impl OverageNotifier {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self { bus }
    }

    pub async fn notify(&self, notice: PlanOverageNotice) {
        let event = RelayEvent::for_tenant(
            notice.organization_id.clone(),
            EventPayload::PlanOverage(notice),
        );
        if let Err(e) = self.bus.publish(&event).await {
            tracing::error!(
                tenant_id = ?event.tenant_id,
                error = %e,
                "Failed to publish overage notice"
            );
        }
    }

    /// Drain notices until the guard is dropped or shutdown is signalled.
    /// Notices queued before shutdown are still published.
    pub fn spawn(
        self,
        mut notices: mpsc::UnboundedReceiver<PlanOverageNotice>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        while let Ok(notice) = notices.try_recv() {
                            self.notify(notice).await;
                        }
                        tracing::debug!("Overage notifier stopped");
                        break;
                    }
                    notice = notices.recv() => {
                        match notice {
                            Some(notice) => self.notify(notice).await,
                            None => break,
                        }
                    }
                }
            }
        })
    }
}
