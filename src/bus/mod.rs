//! Message bus abstraction.
//!
//! Producers publish [`RelayEvent`]s; consumers subscribe per [`Topic`] and
//! receive a channel-backed [`Subscription`]. Cancellation is cooperative: the
//! shutdown signal passed to `subscribe` stops the backend's forwarding task,
//! which drops its sender so the consumer drains what is buffered and then
//! sees the end of the stream.
//!
//! Backends:
//! - `RedisBus`: Redis Pub/Sub, one channel per topic (`<prefix>:<topic>`)
//! - `InMemoryBus`: in-process fan-out for single-node deployments and tests

mod backoff;
mod memory_backend;
mod redis_backend;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::config::BusConfig;
use crate::events::{RelayEvent, Topic};

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use memory_backend::InMemoryBus;
pub use redis_backend::RedisBus;

/// Errors that can occur during bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// The bus could not be reached while registering a subscription
    #[error("Failed to subscribe to {topic}: {reason}")]
    Subscription { topic: Topic, reason: String },

    #[error("Failed to publish to {topic}: {reason}")]
    Publish { topic: Topic, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Stream of events for one topic
pub struct Subscription {
    topic: Topic,
    receiver: mpsc::Receiver<RelayEvent>,
}

impl Subscription {
    pub fn new(topic: Topic, receiver: mpsc::Receiver<RelayEvent>) -> Self {
        Self { topic, receiver }
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Next event in arrival order, or `None` once the subscription is closed
    /// and drained
    pub async fn recv(&mut self) -> Option<RelayEvent> {
        self.receiver.recv().await
    }
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish an event on the channel for its topic
    async fn publish(&self, event: &RelayEvent) -> Result<(), BusError>;

    /// Register a subscription. Returns once the backend has confirmed it.
    async fn subscribe(
        &self,
        topic: Topic,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<Subscription, BusError>;

    /// Backend name for logs and stats
    fn backend_name(&self) -> &'static str;
}

/// Create a bus backend based on configuration.
///
/// - `"redis"` (default): Redis Pub/Sub
/// - `"memory"`: in-process bus
pub fn create_message_bus(config: &BusConfig) -> Result<Arc<dyn MessageBus>, BusError> {
    match config.backend.as_str() {
        "memory" => {
            tracing::info!(backend = "memory", "Creating in-memory message bus");
            Ok(Arc::new(InMemoryBus::new(config.subscription_buffer)))
        }
        other => {
            if other != "redis" {
                tracing::warn!(backend = %other, "Unknown bus backend, falling back to redis");
            }
            tracing::info!(backend = "redis", prefix = %config.channel_prefix, "Creating Redis message bus");
            Ok(Arc::new(RedisBus::new(config)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_memory_bus() {
        let config = BusConfig {
            backend: "memory".to_string(),
            ..Default::default()
        };
        let bus = create_message_bus(&config).unwrap();
        assert_eq!(bus.backend_name(), "memory");
    }

    #[test]
    fn test_create_redis_bus_is_lazy() {
        // Client creation does not connect
        let bus = create_message_bus(&BusConfig::default()).unwrap();
        assert_eq!(bus.backend_name(), "redis");
    }
}
