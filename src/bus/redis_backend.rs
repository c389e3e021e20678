//! Redis Pub/Sub message bus.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{ConnectionManager, PubSub};
use tokio::sync::{broadcast, mpsc, OnceCell};

use crate::config::BusConfig;
use crate::events::{RelayEvent, Topic};
use crate::metrics::BusMetrics;

use super::backoff::ExponentialBackoff;
use super::{BusError, MessageBus, Subscription};

/// How a pump over one pub/sub connection ended
enum PumpExit {
    Shutdown,
    ConsumerGone,
    StreamEnded,
}

/// Redis Pub/Sub bus.
///
/// Each subscription owns a dedicated pub/sub connection and a forwarding
/// task. If the connection drops, the task resubscribes with exponential
/// backoff until shutdown; events published while disconnected are lost,
/// which is acceptable for a live notification channel.
pub struct RedisBus {
    client: redis::Client,
    channel_prefix: String,
    buffer: usize,
    publisher: OnceCell<ConnectionManager>,
}

impl RedisBus {
    /// Create the bus. No connection is opened until first use.
    pub fn new(config: &BusConfig) -> Result<Self, BusError> {
        let client = redis::Client::open(config.url.as_str())?;
        Ok(Self {
            client,
            channel_prefix: config.channel_prefix.clone(),
            buffer: config.subscription_buffer.max(1),
            publisher: OnceCell::new(),
        })
    }

    fn channel(&self, topic: Topic) -> String {
        topic.channel_name(&self.channel_prefix)
    }

    async fn publisher(&self) -> Result<ConnectionManager, BusError> {
        let conn = self
            .publisher
            .get_or_try_init(|| async { ConnectionManager::new(self.client.clone()).await })
            .await?;
        Ok(conn.clone())
    }

    async fn connect(client: &redis::Client, channel: &str) -> redis::RedisResult<PubSub> {
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        Ok(pubsub)
    }

    /// Forward messages from one pub/sub connection until it ends
    async fn pump(
        pubsub: &mut PubSub,
        topic: Topic,
        out: &mpsc::Sender<RelayEvent>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> PumpExit {
        let mut stream = pubsub.on_message();

        loop {
            tokio::select! {
                _ = shutdown.recv() => return PumpExit::Shutdown,
                msg = stream.next() => {
                    let Some(msg) = msg else {
                        return PumpExit::StreamEnded;
                    };

                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(e) => {
                            tracing::warn!(topic = %topic, error = %e, "Failed to get message payload");
                            continue;
                        }
                    };

                    let event: RelayEvent = match serde_json::from_str(&payload) {
                        Ok(event) => event,
                        Err(e) => {
                            tracing::warn!(
                                topic = %topic,
                                error = %e,
                                payload = %payload,
                                "Failed to parse bus message"
                            );
                            continue;
                        }
                    };

                    if event.topic() != topic {
                        tracing::warn!(
                            topic = %topic,
                            event_topic = %event.topic(),
                            "Ignoring event published on the wrong channel"
                        );
                        continue;
                    }

                    BusMetrics::record_received(topic);
                    if out.send(event).await.is_err() {
                        return PumpExit::ConsumerGone;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, event: &RelayEvent) -> Result<(), BusError> {
        let topic = event.topic();
        let payload = serde_json::to_string(event)?;
        let mut conn = self.publisher().await?;

        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(self.channel(topic))
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| BusError::Publish {
                topic,
                reason: e.to_string(),
            })?;

        BusMetrics::record_published(topic);
        tracing::trace!(topic = %topic, receivers = receivers, "Published event to Redis");
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: Topic,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<Subscription, BusError> {
        let channel = self.channel(topic);
        let pubsub = Self::connect(&self.client, &channel)
            .await
            .map_err(|e| BusError::Subscription {
                topic,
                reason: e.to_string(),
            })?;

        tracing::info!(topic = %topic, channel = %channel, "Redis subscription established");

        let (tx, rx) = mpsc::channel(self.buffer);
        let client = self.client.clone();

        tokio::spawn(async move {
            let mut current = Some(pubsub);
            let mut backoff = ExponentialBackoff::new();

            loop {
                let mut pubsub = match current.take() {
                    Some(p) => p,
                    None => {
                        let delay = backoff.next_delay();
                        tokio::select! {
                            _ = shutdown.recv() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }

                        BusMetrics::record_reconnect();
                        match Self::connect(&client, &channel).await {
                            Ok(p) => {
                                tracing::info!(topic = %topic, attempt = backoff.attempt(), "Redis subscription re-established");
                                backoff.reset();
                                p
                            }
                            Err(e) => {
                                tracing::warn!(
                                    topic = %topic,
                                    error = %e,
                                    attempt = backoff.attempt(),
                                    "Redis resubscribe failed"
                                );
                                continue;
                            }
                        }
                    }
                };

                match Self::pump(&mut pubsub, topic, &tx, &mut shutdown).await {
                    PumpExit::Shutdown => {
                        tracing::info!(topic = %topic, "Redis subscription received shutdown signal");
                        break;
                    }
                    PumpExit::ConsumerGone => {
                        tracing::debug!(topic = %topic, "Subscription consumer dropped");
                        break;
                    }
                    PumpExit::StreamEnded => {
                        tracing::warn!(topic = %topic, "Redis message stream ended, resubscribing");
                    }
                }
            }
        });

        Ok(Subscription::new(topic, rx))
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
