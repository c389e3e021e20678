//! HTTP endpoints: health, stats, Prometheus metrics and event publishing.

mod events;
mod health;
mod metrics;
mod routes;

pub use events::{publish_event, PublishEventRequest, PublishEventResponse, OVER_LIMIT_HEADER};
pub use health::{health, stats, HealthResponse, StatsResponse};
pub use metrics::prometheus_metrics;
pub use routes::api_routes;
