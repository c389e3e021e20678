//! In-process message bus.

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};

use crate::events::{RelayEvent, Topic};
use crate::metrics::BusMetrics;

use super::{BusError, MessageBus, Subscription};

/// Fans published events out to every live subscription of the topic.
///
/// Publishing awaits each subscriber's buffer in turn, so events on one topic
/// reach a subscriber in publish order.
pub struct InMemoryBus {
    subscribers: DashMap<Topic, Vec<mpsc::Sender<RelayEvent>>>,
    buffer: usize,
}

impl InMemoryBus {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            buffer: buffer.max(1),
        }
    }

    /// Number of live subscriptions for a topic
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.subscribers
            .get(&topic)
            .map(|subs| subs.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, event: &RelayEvent) -> Result<(), BusError> {
        let topic = event.topic();
        // Clone the senders so no map guard is held across an await
        let senders: Vec<_> = self
            .subscribers
            .get(&topic)
            .map(|subs| subs.clone())
            .unwrap_or_default();

        let mut closed = 0;
        for sender in &senders {
            if sender.send(event.clone()).await.is_err() {
                closed += 1;
            }
        }

        if closed > 0 {
            if let Some(mut subs) = self.subscribers.get_mut(&topic) {
                subs.retain(|s| !s.is_closed());
            }
        }

        BusMetrics::record_published(topic);
        tracing::trace!(topic = %topic, subscribers = senders.len() - closed, "Published event in memory");
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: Topic,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<Subscription, BusError> {
        let (bus_tx, mut bus_rx) = mpsc::channel::<RelayEvent>(self.buffer);
        let (out_tx, out_rx) = mpsc::channel::<RelayEvent>(self.buffer);

        self.subscribers.entry(topic).or_default().push(bus_tx);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        tracing::debug!(topic = %topic, "In-memory subscription stopping");
                        break;
                    }
                    event = bus_rx.recv() => {
                        let Some(event) = event else { break };
                        BusMetrics::record_received(topic);
                        if out_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                }
            }
            // Anything already accepted by the bus is still handed over
            bus_rx.close();
            while let Ok(event) = bus_rx.try_recv() {
                if out_tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        tracing::debug!(topic = %topic, "In-memory subscription registered");
        Ok(Subscription::new(topic, out_rx))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
