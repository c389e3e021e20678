//! Connection management for WebSocket connections
//!
//! This module provides:
//! - Connection handle management
//! - Tenant, group and user indexing
//! - Topic filters per connection
//! - Connection statistics and idle cleanup

mod registry;
mod stats;
mod types;

pub use registry::ConnectionRegistry;
pub use stats::{ConnectionStats, TenantConnectionStats};
pub use types::{ConnectionHandle, ConnectionLimits, RegistryError, ALL_TOPICS};
