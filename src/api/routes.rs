use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::server::{guard_middleware, AppState};

use super::events::publish_event;
use super::health::{health, stats};
use super::metrics::prometheus_metrics;

pub fn api_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/metrics", get(prometheus_metrics))
        .nest(
            "/api/v1",
            Router::new()
                .route("/events", post(publish_event))
                .route_layer(middleware::from_fn_with_state(state, guard_middleware)),
        )
}
