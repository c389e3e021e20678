//! Request guards for the publish surface.
//!
//! A [`GuardPipeline`] runs, in order:
//! 1. `ApiKeyGuard` - the credential must map to an active tenant
//! 2. `ThrottlingGuard` - fixed-window request ceiling per tenant
//!
//! Quota accounting happens afterwards through
//! [`GuardPipeline::record_overage`], once the request's event has actually
//! been published. Rejected, malformed or unpublished requests never count.

mod api_key;
mod overage;
mod quota;
mod throttling;
mod window;

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::Settings;
use crate::events::PlanOverageNotice;
use crate::metrics::GuardMetrics;

pub use api_key::{ApiKeyGuard, TenantContext};
pub use overage::{OverageGuard, OverageNotifier};
pub use quota::{
    OverageStatus, PlanLimits, QuotaSource, QuotaTracker, QuotaUpdate, QuotaUsage,
    StaticQuotaSource,
};
pub use throttling::{ThrottleDecision, ThrottlingGuard};
pub use window::{WindowCounter, WindowDecision};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GuardError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Too many requests, retry after {retry_after}s")]
    TooManyRequests { retry_after: u64, limit: u32 },
}

/// A request that passed every guard
#[derive(Debug, Clone)]
pub struct Admission {
    pub tenant: TenantContext,
    pub throttle: ThrottleDecision,
}

pub struct GuardPipeline {
    api_keys: ApiKeyGuard,
    throttling: Arc<ThrottlingGuard>,
    overage: OverageGuard,
}

impl GuardPipeline {
    pub fn new(api_keys: ApiKeyGuard, throttling: ThrottlingGuard, overage: OverageGuard) -> Self {
        Self {
            api_keys,
            throttling: Arc::new(throttling),
            overage,
        }
    }

    /// Build the pipeline from settings, sharing `tracker` with the broker.
    /// Returns the receiving end of the overage notice channel.
    pub fn from_settings(
        settings: &Settings,
        tracker: Arc<QuotaTracker>,
    ) -> (Self, mpsc::UnboundedReceiver<PlanOverageNotice>) {
        let (overage, notices) = OverageGuard::new(tracker);
        let pipeline = Self::new(
            ApiKeyGuard::new(&settings.tenants),
            ThrottlingGuard::new(settings.throttling.clone()),
            overage,
        );
        (pipeline, notices)
    }

    pub fn throttling(&self) -> &Arc<ThrottlingGuard> {
        &self.throttling
    }

    pub fn admit(&self, credential: Option<&str>) -> Result<Admission, GuardError> {
        let tenant = self.api_keys.authenticate(credential).inspect_err(|_| {
            GuardMetrics::record_unauthorized();
        })?;

        let throttle = self.throttling.check(&tenant.tenant_id);
        if let ThrottleDecision::Denied {
            retry_after, limit, ..
        } = throttle
        {
            GuardMetrics::record_throttled();
            return Err(GuardError::TooManyRequests { retry_after, limit });
        }

        GuardMetrics::record_admitted();
        Ok(Admission { tenant, throttle })
    }

    /// Count one published event against the tenant's plan quota
    pub fn record_overage(&self, tenant: &TenantContext) -> OverageStatus {
        self.overage.check(tenant)
    }
}
