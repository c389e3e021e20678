use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::config::WebSocketConfig;
use crate::connection_manager::{ConnectionHandle, ConnectionRegistry};
use crate::guards::ThrottlingGuard;
use crate::metrics::{ConnectionMetrics, HeartbeatMetrics};
use crate::websocket::ServerMessage;

/// Timeout for individual heartbeat send operations
const HEARTBEAT_SEND_TIMEOUT_MS: u64 = 5000;

/// Maximum concurrent heartbeat sends
const MAX_CONCURRENT_HEARTBEATS: usize = 1000;

enum HeartbeatOutcome {
    Sent,
    Failed(Arc<ConnectionHandle>),
    TimedOut,
}

/// Background task for heartbeats, idle-connection cleanup and stale
/// throttling window cleanup
pub struct HeartbeatTask {
    config: WebSocketConfig,
    registry: Arc<ConnectionRegistry>,
    throttling: Option<Arc<ThrottlingGuard>>,
    shutdown: broadcast::Receiver<()>,
}

impl HeartbeatTask {
    pub fn new(
        config: WebSocketConfig,
        registry: Arc<ConnectionRegistry>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            config,
            registry,
            throttling: None,
            shutdown,
        }
    }

    pub fn with_throttling(mut self, throttling: Arc<ThrottlingGuard>) -> Self {
        self.throttling = Some(throttling);
        self
    }

    pub async fn run(mut self) {
        let heartbeat_interval = Duration::from_secs(self.config.heartbeat_interval.max(1));
        let cleanup_interval = Duration::from_secs(self.config.cleanup_interval.max(1));
        let connection_timeout = self.config.connection_timeout;

        let mut heartbeat_timer = tokio::time::interval(heartbeat_interval);
        let mut cleanup_timer = tokio::time::interval(cleanup_interval);

        // Skip immediate first tick
        heartbeat_timer.tick().await;
        cleanup_timer.tick().await;

        tracing::info!(
            heartbeat_interval_secs = self.config.heartbeat_interval,
            cleanup_interval_secs = self.config.cleanup_interval,
            connection_timeout_secs = connection_timeout,
            "Heartbeat task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Heartbeat task received shutdown signal");
                    break;
                }
                _ = heartbeat_timer.tick() => {
                    self.send_heartbeats().await;
                }
                _ = cleanup_timer.tick() => {
                    self.cleanup(connection_timeout).await;
                }
            }
        }

        tracing::info!("Heartbeat task stopped");
    }

    /// Send a heartbeat to every connection in bounded parallel batches.
    /// Connections whose channel is gone are deregistered.
    async fn send_heartbeats(&self) {
        let connections = self.registry.get_all_connections().await;
        let total_count = connections.len();

        if total_count == 0 {
            return;
        }

        let start = Instant::now();
        let send_timeout = Duration::from_millis(HEARTBEAT_SEND_TIMEOUT_MS);
        let mut sent = 0;
        let mut timed_out = 0;
        let mut dead = Vec::new();

        for batch in connections.chunks(MAX_CONCURRENT_HEARTBEATS) {
            let futures = batch.iter().cloned().map(|handle| async move {
                let outcome = timeout(send_timeout, handle.send(ServerMessage::Heartbeat)).await;
                match outcome {
                    Ok(Ok(())) => HeartbeatOutcome::Sent,
                    Ok(Err(_)) => HeartbeatOutcome::Failed(handle),
                    Err(_) => HeartbeatOutcome::TimedOut,
                }
            });

            for outcome in join_all(futures).await {
                match outcome {
                    HeartbeatOutcome::Sent => sent += 1,
                    HeartbeatOutcome::Failed(handle) => dead.push(handle),
                    HeartbeatOutcome::TimedOut => timed_out += 1,
                }
            }
        }

        for handle in &dead {
            tracing::debug!(connection_id = %handle.id, "Heartbeat failed, removing connection");
            handle.close();
            self.registry.remove(handle.id).await;
        }

        let elapsed_ms = start.elapsed().as_millis() as u64;
        HeartbeatMetrics::record_duration_ms(elapsed_ms);
        if timed_out > 0 {
            HeartbeatMetrics::record_timeouts(timed_out as u64);
        }

        let stats = self.registry.stats().await;
        ConnectionMetrics::set_current(stats.total_connections, stats.unique_users);

        tracing::debug!(
            total = total_count,
            sent = sent,
            failed = dead.len(),
            timed_out = timed_out,
            elapsed_ms = elapsed_ms,
            "Heartbeat round completed"
        );

        if elapsed_ms > (self.config.heartbeat_interval * 1000 / 2) {
            tracing::warn!(
                elapsed_ms = elapsed_ms,
                heartbeat_interval_ms = self.config.heartbeat_interval * 1000,
                connections = total_count,
                "Heartbeat round took more than 50% of interval"
            );
        }
    }

    async fn cleanup(&self, timeout_secs: u64) {
        let removed = self.registry.cleanup_stale_connections(timeout_secs).await;
        if removed > 0 {
            HeartbeatMetrics::record_stale_cleaned(removed);
            tracing::info!(
                removed = removed,
                timeout_secs = timeout_secs,
                "Cleaned up stale connections"
            );
        }

        if let Some(throttling) = &self.throttling {
            throttling.cleanup_stale();
        }
    }
}
