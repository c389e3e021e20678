use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::websocket::OutboundMessage;

use super::stats::{ConnectionStats, TenantConnectionStats};
use super::types::{ConnectionHandle, ConnectionLimits, RegistryError, ALL_TOPICS};

/// Index maps guarded together so every mutation updates them atomically.
#[derive(Default)]
struct RegistryIndex {
    /// connection_id -> ConnectionHandle
    connections: HashMap<Uuid, Arc<ConnectionHandle>>,
    /// tenant or group id -> Set<connection_id>
    group_index: HashMap<String, HashSet<Uuid>>,
    /// user_id -> Set<connection_id> (supports multiple devices)
    user_index: HashMap<String, HashSet<Uuid>>,
    /// connection_id -> groups the connection is indexed under
    memberships: HashMap<Uuid, HashSet<String>>,
}

impl RegistryIndex {
    fn index_group(&mut self, group: &str, connection_id: Uuid) {
        self.group_index
            .entry(group.to_string())
            .or_default()
            .insert(connection_id);
        self.memberships
            .entry(connection_id)
            .or_default()
            .insert(group.to_string());
    }

    fn unindex_group(&mut self, group: &str, connection_id: Uuid) {
        if let Some(conns) = self.group_index.get_mut(group) {
            conns.remove(&connection_id);
            if conns.is_empty() {
                self.group_index.remove(group);
            }
        }
        if let Some(groups) = self.memberships.get_mut(&connection_id) {
            groups.remove(group);
        }
    }

    fn resolve(&self, ids: Option<&HashSet<Uuid>>) -> Vec<Arc<ConnectionHandle>> {
        ids.map(|ids| {
            ids.iter()
                .filter_map(|id| self.connections.get(id).cloned())
                .collect()
        })
        .unwrap_or_default()
    }
}

/// Registry of live connections indexed by tenant, group and user.
///
/// Mutations take the write lock and update every index before releasing it,
/// so readers always see a consistent snapshot. Lookups return cloned handles
/// that stay valid even if the connection is removed afterwards.
pub struct ConnectionRegistry {
    index: RwLock<RegistryIndex>,
    limits: ConnectionLimits,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::with_limits(ConnectionLimits::default())
    }

    pub fn with_limits(limits: ConnectionLimits) -> Self {
        Self {
            index: RwLock::new(RegistryIndex::default()),
            limits,
        }
    }

    pub fn limits(&self) -> &ConnectionLimits {
        &self.limits
    }

    /// Create a handle for a freshly upgraded socket and register it
    pub async fn register(
        &self,
        user_id: String,
        tenant_id: String,
        sender: mpsc::Sender<OutboundMessage>,
    ) -> Result<Arc<ConnectionHandle>, RegistryError> {
        let handle = Arc::new(ConnectionHandle::new(user_id, tenant_id, sender));
        self.add(handle.clone()).await?;
        Ok(handle)
    }

    /// Register a live connection under its tenant and user
    pub async fn add(&self, handle: Arc<ConnectionHandle>) -> Result<(), RegistryError> {
        let mut index = self.index.write().await;

        if index.connections.contains_key(&handle.id) {
            tracing::error!(connection_id = %handle.id, "Duplicate connection id");
            return Err(RegistryError::DuplicateConnection(handle.id));
        }

        let current = index.connections.len();
        if current >= self.limits.max_connections {
            return Err(RegistryError::TotalLimitExceeded {
                current,
                max: self.limits.max_connections,
            });
        }

        let user_count = index
            .user_index
            .get(&handle.user_id)
            .map(|c| c.len())
            .unwrap_or(0);
        if user_count >= self.limits.max_connections_per_user {
            return Err(RegistryError::UserLimitExceeded {
                user_id: handle.user_id.clone(),
                current: user_count,
                max: self.limits.max_connections_per_user,
            });
        }

        let conn_id = handle.id;
        index.connections.insert(conn_id, handle.clone());
        index
            .user_index
            .entry(handle.user_id.clone())
            .or_default()
            .insert(conn_id);
        index.index_group(&handle.tenant_id, conn_id);

        tracing::info!(
            connection_id = %conn_id,
            user_id = %handle.user_id,
            tenant_id = %handle.tenant_id,
            "Connection registered"
        );

        Ok(())
    }

    /// Remove a connection from every index. No-op if it is already gone.
    pub async fn remove(&self, connection_id: Uuid) -> Option<Arc<ConnectionHandle>> {
        let mut index = self.index.write().await;
        let handle = index.connections.remove(&connection_id)?;

        if let Some(user_conns) = index.user_index.get_mut(&handle.user_id) {
            user_conns.remove(&connection_id);
            if user_conns.is_empty() {
                index.user_index.remove(&handle.user_id);
            }
        }

        let groups = index.memberships.remove(&connection_id).unwrap_or_default();
        for group in &groups {
            index.unindex_group(group, connection_id);
        }

        tracing::info!(
            connection_id = %connection_id,
            user_id = %handle.user_id,
            tenant_id = %handle.tenant_id,
            "Connection unregistered"
        );

        Some(handle)
    }

    /// Get all connections indexed under a tenant or group
    pub async fn get_connections(&self, tenant_id: &str) -> Vec<Arc<ConnectionHandle>> {
        let index = self.index.read().await;
        index.resolve(index.group_index.get(tenant_id))
    }

    /// Get the ids of all connections indexed under a tenant or group
    pub async fn get_connection_ids(&self, tenant_id: &str) -> Vec<Uuid> {
        self.index
            .read()
            .await
            .group_index
            .get(tenant_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Get one user's connections within a tenant or group
    pub async fn get_user_connections(
        &self,
        tenant_id: &str,
        user_id: &str,
    ) -> Vec<Arc<ConnectionHandle>> {
        let index = self.index.read().await;
        let (Some(group), Some(user)) = (
            index.group_index.get(tenant_id),
            index.user_index.get(user_id),
        ) else {
            return Vec::new();
        };

        group
            .intersection(user)
            .filter_map(|id| index.connections.get(id).cloned())
            .collect()
    }

    /// Get all of a user's connections regardless of tenant
    pub async fn get_connections_for_user(&self, user_id: &str) -> Vec<Arc<ConnectionHandle>> {
        let index = self.index.read().await;
        index.resolve(index.user_index.get(user_id))
    }

    /// Get all connections
    pub async fn get_all_connections(&self) -> Vec<Arc<ConnectionHandle>> {
        self.index
            .read()
            .await
            .connections
            .values()
            .cloned()
            .collect()
    }

    /// Get connection by ID
    pub async fn get(&self, connection_id: Uuid) -> Option<Arc<ConnectionHandle>> {
        self.index
            .read()
            .await
            .connections
            .get(&connection_id)
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.connections.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Index every live connection of a user under an additional group.
    /// Returns the number of connections affected.
    pub async fn add_membership(&self, user_id: &str, group: &str) -> usize {
        let mut index = self.index.write().await;
        let conn_ids: Vec<Uuid> = index
            .user_index
            .get(user_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();

        for conn_id in &conn_ids {
            index.index_group(group, *conn_id);
        }

        if !conn_ids.is_empty() {
            tracing::debug!(user_id = %user_id, group = %group, connections = conn_ids.len(), "Added group membership");
        }
        conn_ids.len()
    }

    /// Drop a user's connections from a group. A connection is never removed
    /// from its owning tenant. Returns the number of connections affected.
    pub async fn remove_membership(&self, user_id: &str, group: &str) -> usize {
        let mut index = self.index.write().await;
        let conn_ids: Vec<Uuid> = index
            .user_index
            .get(user_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();

        let mut removed = 0;
        for conn_id in conn_ids {
            let owned = index
                .connections
                .get(&conn_id)
                .map(|h| h.tenant_id == group)
                .unwrap_or(true);
            if owned {
                continue;
            }
            index.unindex_group(group, conn_id);
            removed += 1;
        }

        if removed > 0 {
            tracing::debug!(user_id = %user_id, group = %group, connections = removed, "Removed group membership");
        }
        removed
    }

    /// Replace wildcard or add topic filters on a connection.
    /// Returns the filters that were accepted.
    pub async fn subscribe_topics(
        &self,
        connection_id: Uuid,
        topics: &[String],
    ) -> Result<Vec<String>, String> {
        let Some(handle) = self.get(connection_id).await else {
            return Err(format!("Unknown connection {}", connection_id));
        };

        let mut filters = handle.topic_filters.write().await;
        // An explicit subscription narrows the default catch-all
        if filters.len() == 1 && filters.contains(ALL_TOPICS) && !topics.iter().any(|t| t == ALL_TOPICS) {
            filters.clear();
        }

        let mut accepted = Vec::new();
        for topic in topics {
            if filters.contains(topic) {
                accepted.push(topic.clone());
                continue;
            }
            if filters.len() >= self.limits.max_topic_filters_per_connection {
                return Err(format!(
                    "Topic filter limit exceeded ({})",
                    self.limits.max_topic_filters_per_connection
                ));
            }
            filters.insert(topic.clone());
            accepted.push(topic.clone());
        }

        tracing::debug!(connection_id = %connection_id, topics = ?accepted, "Subscribed to topics");
        Ok(accepted)
    }

    /// Remove topic filters from a connection
    pub async fn unsubscribe_topics(&self, connection_id: Uuid, topics: &[String]) -> Vec<String> {
        let Some(handle) = self.get(connection_id).await else {
            return Vec::new();
        };

        let mut filters = handle.topic_filters.write().await;
        let removed: Vec<String> = topics
            .iter()
            .filter(|t| filters.remove(t.as_str()))
            .cloned()
            .collect();

        tracing::debug!(connection_id = %connection_id, topics = ?removed, "Unsubscribed from topics");
        removed
    }

    /// Get statistics
    pub async fn stats(&self) -> ConnectionStats {
        let index = self.index.read().await;
        ConnectionStats {
            total_connections: index.connections.len(),
            unique_users: index.user_index.len(),
            tenants: index
                .group_index
                .iter()
                .map(|(k, v)| (k.clone(), v.len()))
                .collect(),
        }
    }

    /// Statistics for a single tenant's own connections
    pub async fn tenant_stats(&self, tenant_id: &str) -> TenantConnectionStats {
        let connections = self.get_connections(tenant_id).await;
        let users: HashSet<&str> = connections.iter().map(|c| c.user_id.as_str()).collect();
        TenantConnectionStats {
            tenant_id: tenant_id.to_string(),
            total_connections: connections.len(),
            unique_users: users.len(),
        }
    }

    /// Find connections that have been inactive for longer than the timeout
    pub async fn find_stale_connections(&self, timeout_secs: u64) -> Vec<Arc<ConnectionHandle>> {
        let now = Utc::now();
        let timeout = chrono::Duration::seconds(timeout_secs as i64);

        self.index
            .read()
            .await
            .connections
            .values()
            .filter(|h| now.signed_duration_since(h.last_activity()) > timeout)
            .cloned()
            .collect()
    }

    /// Close and remove stale connections, returning how many were removed
    pub async fn cleanup_stale_connections(&self, timeout_secs: u64) -> usize {
        let stale = self.find_stale_connections(timeout_secs).await;
        let mut count = 0;

        for handle in stale {
            tracing::info!(connection_id = %handle.id, "Removing stale connection due to timeout");
            handle.close();
            if self.remove(handle.id).await.is_some() {
                count += 1;
            }
        }

        count
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
