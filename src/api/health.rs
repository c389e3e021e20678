//! Health check and statistics endpoints.

use std::collections::HashMap;

use axum::{extract::State, Json};
use serde::Serialize;

use crate::broker::BrokerStatsSnapshot;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub bus_backend: String,
    pub connections: ConnectionHealthResponse,
}

#[derive(Debug, Serialize)]
pub struct ConnectionHealthResponse {
    pub total: usize,
    pub unique_users: usize,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub connections: ConnectionStatsResponse,
    pub deliveries: BrokerStatsSnapshot,
    pub throttling: ThrottlingStatsResponse,
    pub tenants: Vec<TenantQuotaResponse>,
}

#[derive(Debug, Serialize)]
pub struct ConnectionStatsResponse {
    pub total_connections: usize,
    pub unique_users: usize,
    pub tenants: HashMap<String, usize>,
}

#[derive(Debug, Serialize)]
pub struct ThrottlingStatsResponse {
    pub enabled: bool,
    pub max_requests: u32,
    pub window_seconds: u64,
    pub tracked_tenants: usize,
}

#[derive(Debug, Serialize)]
pub struct TenantQuotaResponse {
    pub tenant_id: String,
    pub connections: usize,
    pub connected_users: usize,
    pub events_this_hour: u64,
    pub events_this_month: u64,
    pub max_events_per_hour: Option<u64>,
    pub max_events_per_month: Option<u64>,
    pub over_limit: bool,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let conn_stats = state.registry.stats().await;

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        bus_backend: state.bus.backend_name().to_string(),
        connections: ConnectionHealthResponse {
            total: conn_stats.total_connections,
            unique_users: conn_stats.unique_users,
        },
    })
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let conn_stats = state.registry.stats().await;
    let throttling = state.guards.throttling();

    let mut quota = Vec::with_capacity(state.settings.tenants.len());
    for tenant in &state.settings.tenants {
        let usage = state.quota.usage(&tenant.id);
        let limits = state.quota.limits(&tenant.id);
        let connected = state.registry.tenant_stats(&tenant.id).await;
        quota.push(TenantQuotaResponse {
            tenant_id: tenant.id.clone(),
            connections: connected.total_connections,
            connected_users: connected.unique_users,
            events_this_hour: usage.hourly,
            events_this_month: usage.monthly,
            max_events_per_hour: limits.max_events_per_hour,
            max_events_per_month: limits.max_events_per_month,
            over_limit: state.quota.is_over(&tenant.id),
        });
    }

    Json(StatsResponse {
        connections: ConnectionStatsResponse {
            total_connections: conn_stats.total_connections,
            unique_users: conn_stats.unique_users,
            tenants: conn_stats.tenants,
        },
        deliveries: state.broker.stats(),
        throttling: ThrottlingStatsResponse {
            enabled: throttling.is_enabled(),
            max_requests: throttling.config().max_requests,
            window_seconds: throttling.config().window_seconds,
            tracked_tenants: throttling.tracked_tenants(),
        },
        tenants: quota,
    })
}
