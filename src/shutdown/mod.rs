//! Graceful shutdown of the relay.
//!
//! 1. Notify connected clients about the impending shutdown
//! 2. Signal bus subscriptions and background tasks to stop
//! 3. Let dispatch loops drain events already received from the bus
//! 4. Close remaining connections and wait for their sockets to finish

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::connection_manager::ConnectionRegistry;
use crate::websocket::ServerMessage;

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time to wait for clients to be notified
    pub client_notification_timeout: Duration,
    /// Time to wait for dispatch loops to drain
    pub drain_timeout: Duration,
    /// Time to wait for sockets to close
    pub close_timeout: Duration,
    /// Suggested reconnect delay sent to clients
    pub reconnect_after_seconds: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            client_notification_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
            reconnect_after_seconds: 5,
        }
    }
}

pub struct GracefulShutdown {
    registry: Arc<ConnectionRegistry>,
    shutdown_tx: broadcast::Sender<()>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    pub fn new(registry: Arc<ConnectionRegistry>, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self::with_config(registry, shutdown_tx, ShutdownConfig::default())
    }

    pub fn with_config(
        registry: Arc<ConnectionRegistry>,
        shutdown_tx: broadcast::Sender<()>,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            registry,
            shutdown_tx,
            config,
        }
    }

    /// Run the shutdown sequence. `workers` are the dispatch loops and
    /// background tasks that end once the shutdown signal is observed.
    #[tracing::instrument(name = "graceful_shutdown", skip(self, workers))]
    pub async fn execute(&self, reason: &str, workers: Vec<JoinHandle<()>>) -> ShutdownResult {
        let start = std::time::Instant::now();
        let mut result = ShutdownResult::default();

        tracing::info!(reason = %reason, "Starting graceful shutdown - Phase 1: Notifying clients");
        result.clients_notified = self.notify_clients(reason).await;

        tracing::info!("Phase 2: Signaling subscriptions and background tasks to stop");
        let _ = self.shutdown_tx.send(());

        tracing::info!(workers = workers.len(), "Phase 3: Draining dispatch loops");
        result.workers_drained = self.drain_workers(workers).await;

        tracing::info!("Phase 4: Closing connections");
        result.connections_closed = self.close_connections().await;

        result.duration = start.elapsed();
        result.success = true;

        tracing::info!(
            clients_notified = result.clients_notified,
            connections_closed = result.connections_closed,
            workers_drained = result.workers_drained,
            duration_ms = result.duration.as_millis(),
            "Graceful shutdown completed"
        );

        result
    }

    async fn notify_clients(&self, reason: &str) -> usize {
        let connections = self.registry.get_all_connections().await;
        let total = connections.len();

        if total == 0 {
            return 0;
        }

        let message = ServerMessage::shutdown(reason, Some(self.config.reconnect_after_seconds));
        let mut futures = FuturesUnordered::new();
        let mut notified = 0;

        for conn in connections {
            let msg = message.clone();
            futures.push(async move {
                match timeout(Duration::from_secs(2), conn.send(msg)).await {
                    Ok(Ok(_)) => true,
                    Ok(Err(_)) | Err(_) => {
                        tracing::debug!(
                            connection_id = %conn.id,
                            "Failed to send shutdown notification"
                        );
                        false
                    }
                }
            });
        }

        let notify_future = async {
            while let Some(success) = futures.next().await {
                if success {
                    notified += 1;
                }
            }
        };
        let _ = timeout(self.config.client_notification_timeout, notify_future).await;

        tracing::info!(notified = notified, total = total, "Shutdown notifications sent");
        notified
    }

    /// Returns true if every worker finished within the drain timeout
    async fn drain_workers(&self, workers: Vec<JoinHandle<()>>) -> bool {
        if workers.is_empty() {
            return true;
        }

        match timeout(self.config.drain_timeout, join_all(workers)).await {
            Ok(results) => {
                let panicked = results.iter().filter(|r| r.is_err()).count();
                if panicked > 0 {
                    tracing::warn!(panicked = panicked, "Some workers ended abnormally");
                }
                true
            }
            Err(_) => {
                tracing::warn!("Dispatch drain timeout, remaining events may be lost");
                false
            }
        }
    }

    async fn close_connections(&self) -> usize {
        let connections = self.registry.get_all_connections().await;
        let initial = connections.len();
        if initial == 0 {
            return 0;
        }

        for conn in &connections {
            conn.close();
        }

        let wait_future = async {
            while !self.registry.is_empty().await {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };
        let _ = timeout(self.config.close_timeout, wait_future).await;

        let remaining = self.registry.len().await;
        if remaining > 0 {
            tracing::warn!(
                remaining_connections = remaining,
                "Some connections did not close gracefully"
            );
        }

        initial.saturating_sub(remaining)
    }
}

#[derive(Debug, Default)]
pub struct ShutdownResult {
    pub success: bool,
    pub clients_notified: usize,
    pub connections_closed: usize,
    /// Whether every dispatch loop drained before the timeout
    pub workers_drained: bool,
    pub duration: Duration,
}
