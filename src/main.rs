use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use event_relay::broker::broker_topics;
use event_relay::bus::create_message_bus;
use event_relay::config::Settings;
use event_relay::connection_manager::ConnectionRegistry;
use event_relay::guards::OverageNotifier;
use event_relay::relay::StatusRelay;
use event_relay::server::{create_app, AppState};
use event_relay::shutdown::GracefulShutdown;
use event_relay::tasks::HeartbeatTask;
use event_relay::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::new()?;
    let _telemetry = init_telemetry(&settings.otel)?;
    tracing::info!("Configuration loaded");

    let bus = create_message_bus(&settings.bus)?;
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let (state, overage_notices) = AppState::build(settings.clone(), bus.clone());
    tracing::info!(
        tenants = settings.tenants.len(),
        bus = bus.backend_name(),
        "Application state initialized"
    );

    // Subscriptions must all succeed before the server accepts traffic
    let mut workers = state
        .broker
        .start(bus.as_ref(), &broker_topics(), &shutdown_tx)
        .await?;

    let status_relay = Arc::new(StatusRelay::new(state.broker.clone()));
    workers.push(status_relay.start(bus.as_ref(), &shutdown_tx).await?);

    workers.push(OverageNotifier::new(bus.clone()).spawn(overage_notices, shutdown_tx.subscribe()));

    let heartbeat_task = HeartbeatTask::new(
        settings.websocket.clone(),
        state.registry.clone(),
        shutdown_tx.subscribe(),
    )
    .with_throttling(state.guards.throttling().clone());
    workers.push(tokio::spawn(heartbeat_task.run()));

    let registry = state.registry.clone();
    let app = create_app(state);

    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_handler(registry, shutdown_tx, workers))
        .await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Waits for Ctrl+C or SIGTERM, then drains the relay before the HTTP server
/// stops.
async fn shutdown_signal_handler(
    registry: Arc<ConnectionRegistry>,
    shutdown_tx: broadcast::Sender<()>,
    workers: Vec<JoinHandle<()>>,
) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let reason = tokio::select! {
        _ = ctrl_c => "Received Ctrl+C",
        _ = terminate => "Received terminate signal",
    };
    tracing::info!("{}, initiating graceful shutdown", reason);

    GracefulShutdown::new(registry, shutdown_tx)
        .execute("Server is shutting down", workers)
        .await;
}
