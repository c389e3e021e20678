use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::auth::JwtValidator;
use crate::broker::{BrokerConfig, MessageBroker};
use crate::bus::MessageBus;
use crate::config::Settings;
use crate::connection_manager::{ConnectionLimits, ConnectionRegistry};
use crate::events::PlanOverageNotice;
use crate::guards::{GuardPipeline, QuotaTracker, StaticQuotaSource};

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub jwt_validator: Arc<JwtValidator>,
    pub registry: Arc<ConnectionRegistry>,
    pub broker: Arc<MessageBroker>,
    pub guards: Arc<GuardPipeline>,
    pub quota: Arc<QuotaTracker>,
    pub bus: Arc<dyn MessageBus>,
    pub start_time: Instant,
}

impl AppState {
    /// Wire every service from settings. The returned receiver carries
    /// overage notices raised by the guard pipeline and is meant for an
    /// [`crate::guards::OverageNotifier`].
    pub fn build(
        settings: Settings,
        bus: Arc<dyn MessageBus>,
    ) -> (Self, mpsc::UnboundedReceiver<PlanOverageNotice>) {
        let jwt_validator = Arc::new(JwtValidator::new(&settings.jwt));

        let limits = ConnectionLimits {
            max_connections: settings.websocket.max_connections,
            max_connections_per_user: settings.websocket.max_connections_per_user,
            max_topic_filters_per_connection: settings.websocket.max_topic_filters_per_connection,
        };
        let registry = Arc::new(ConnectionRegistry::with_limits(limits));

        let source = StaticQuotaSource::from_settings(&settings.quota, &settings.tenants);
        let quota = Arc::new(QuotaTracker::new(Arc::new(source)));

        let broker = Arc::new(MessageBroker::new(
            registry.clone(),
            quota.clone(),
            BrokerConfig::from_settings(&settings),
        ));

        let (guards, notices) = GuardPipeline::from_settings(&settings, quota.clone());

        let state = Self {
            settings: Arc::new(settings),
            jwt_validator,
            registry,
            broker,
            guards: Arc::new(guards),
            quota,
            bus,
            start_time: Instant::now(),
        };
        (state, notices)
    }
}
