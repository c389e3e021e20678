//! Connection statistics and info structures

use serde::Serialize;
use std::collections::HashMap;

/// Connection statistics
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub total_connections: usize,
    pub unique_users: usize,
    /// Connections per tenant or group index
    pub tenants: HashMap<String, usize>,
}

/// Tenant-specific connection statistics
#[derive(Debug, Clone, Serialize)]
pub struct TenantConnectionStats {
    pub tenant_id: String,
    pub total_connections: usize,
    pub unique_users: usize,
}
