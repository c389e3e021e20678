//! Connection handle and related types

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, Notify, RwLock};
use uuid::Uuid;

use crate::events::Topic;
use crate::websocket::{OutboundMessage, ServerMessage};

/// Topic filter matching every topic
pub const ALL_TOPICS: &str = "*";

/// Handle for a single WebSocket connection
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: Uuid,
    pub user_id: String,
    pub tenant_id: String,
    pub sender: mpsc::Sender<OutboundMessage>,
    pub connected_at: DateTime<Utc>,
    /// Last activity timestamp (Unix seconds) - using AtomicI64 for lock-free updates
    last_activity: AtomicI64,
    pub topic_filters: RwLock<HashSet<String>>,
    closed: AtomicBool,
    close_signal: Notify,
}

impl ConnectionHandle {
    pub fn new(user_id: String, tenant_id: String, sender: mpsc::Sender<OutboundMessage>) -> Self {
        Self::with_id(Uuid::new_v4(), user_id, tenant_id, sender)
    }

    pub fn with_id(
        id: Uuid,
        user_id: String,
        tenant_id: String,
        sender: mpsc::Sender<OutboundMessage>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id,
            tenant_id,
            sender,
            connected_at: now,
            last_activity: AtomicI64::new(now.timestamp()),
            topic_filters: RwLock::new(HashSet::from([ALL_TOPICS.to_string()])),
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
        }
    }

    pub fn update_activity(&self) {
        self.last_activity
            .store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.last_activity.load(Ordering::Relaxed), 0)
            .unwrap_or_else(Utc::now)
    }

    #[cfg(test)]
    pub(crate) fn set_last_activity(&self, at: DateTime<Utc>) {
        self.last_activity.store(at.timestamp(), Ordering::Relaxed);
    }

    /// Send a ServerMessage (will be serialized when sent to WebSocket)
    pub async fn send(
        &self,
        message: ServerMessage,
    ) -> Result<(), mpsc::error::SendError<OutboundMessage>> {
        self.sender.send(OutboundMessage::Raw(message)).await
    }

    /// Send a pre-serialized message (for efficient multi-send scenarios)
    pub async fn send_preserialized(
        &self,
        message: OutboundMessage,
    ) -> Result<(), mpsc::error::SendError<OutboundMessage>> {
        self.sender.send(message).await
    }

    /// Whether any of this connection's topic filters matches the topic
    pub async fn accepts(&self, topic: Topic) -> bool {
        let filters = self.topic_filters.read().await;
        filters.contains(ALL_TOPICS) || filters.contains(topic.as_str())
    }

    /// Ask the connection's socket loops to shut down
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.close_signal.notify_one();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once [`ConnectionHandle::close`] has been called
    pub async fn closed(&self) {
        if self.is_closed() {
            return;
        }
        self.close_signal.notified().await;
    }
}

/// Errors raised by the connection registry
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Connection {0} is already registered")]
    DuplicateConnection(Uuid),
    #[error("Total connection limit exceeded ({current}/{max})")]
    TotalLimitExceeded { current: usize, max: usize },
    #[error("User {user_id} connection limit exceeded ({current}/{max})")]
    UserLimitExceeded {
        user_id: String,
        current: usize,
        max: usize,
    },
}

/// Limits for connection management
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub max_connections: usize,
    pub max_connections_per_user: usize,
    pub max_topic_filters_per_connection: usize,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_connections: 10000,
            max_connections_per_user: 5,
            max_topic_filters_per_connection: 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (ConnectionHandle, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(4);
        (
            ConnectionHandle::new("user-1".into(), "org-1".into(), tx),
            rx,
        )
    }

    #[tokio::test]
    async fn test_default_filter_accepts_everything() {
        let (handle, _rx) = handle();
        for topic in Topic::ALL {
            assert!(handle.accepts(topic).await);
        }
    }

    #[tokio::test]
    async fn test_specific_filter() {
        let (handle, _rx) = handle();
        {
            let mut filters = handle.topic_filters.write().await;
            filters.clear();
            filters.insert("work-item-status".to_string());
        }
        assert!(handle.accepts(Topic::WorkItemStatus).await);
        assert!(!handle.accepts(Topic::EntityChanged).await);
    }

    #[tokio::test]
    async fn test_close_before_wait_resolves() {
        let (handle, _rx) = handle();
        handle.close();
        assert!(handle.is_closed());
        tokio::time::timeout(std::time::Duration::from_millis(100), handle.closed())
            .await
            .expect("closed() should resolve after close()");
    }
}
