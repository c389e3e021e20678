//! Event publishing endpoint for tenant backends.

use axum::{
    extract::State,
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::events::{EventPayload, RelayEvent};
use crate::guards::Admission;
use crate::server::AppState;

/// Response header set to `true` once the tenant is past a plan ceiling
pub const OVER_LIMIT_HEADER: &str = "X-Over-Limit";

#[derive(Debug, Deserialize)]
pub struct PublishEventRequest {
    pub payload: EventPayload,
    /// Narrow delivery to one user's connections
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PublishEventResponse {
    pub event_id: Uuid,
    pub over_limit: bool,
}

/// POST /api/v1/events
///
/// Publishes an entity change or work item status on the bus, scoped to the
/// tenant that owns the API key. Only a successful publish counts toward the
/// tenant's plan quota.
pub async fn publish_event(
    State(state): State<AppState>,
    Extension(admission): Extension<Admission>,
    Json(request): Json<PublishEventRequest>,
) -> Result<Response> {
    let payload = validate_payload(request.payload)?;

    let mut event = RelayEvent::for_tenant(admission.tenant.tenant_id.clone(), payload);
    if let Some(user_id) = request.user_id.filter(|u| !u.is_empty()) {
        event = event.with_user(user_id);
    }

    state.bus.publish(&event).await?;

    let over_limit = state
        .guards
        .record_overage(&admission.tenant)
        .is_over_limit();
    tracing::debug!(
        event_id = %event.id,
        tenant_id = %admission.tenant.tenant_id,
        topic = %event.topic(),
        over_limit = over_limit,
        "Event published"
    );

    let body = PublishEventResponse {
        event_id: event.id,
        over_limit,
    };
    let mut response = (StatusCode::ACCEPTED, Json(body)).into_response();
    response.headers_mut().insert(
        OVER_LIMIT_HEADER,
        HeaderValue::from_static(if over_limit { "true" } else { "false" }),
    );
    Ok(response)
}

fn validate_payload(payload: EventPayload) -> Result<EventPayload> {
    match payload {
        EventPayload::EntityChanged(change) => {
            if change.entity_type.trim().is_empty() {
                return Err(AppError::Validation("Entity type is required".to_string()));
            }
            Ok(EventPayload::EntityChanged(change))
        }
        EventPayload::WorkItemStatus(mut status) => {
            status.progress = status.progress.clamp(0, 100);
            Ok(EventPayload::WorkItemStatus(status))
        }
        other => Err(AppError::Validation(format!(
            "Events on topic {} cannot be published through the API",
            other.topic()
        ))),
    }
}
