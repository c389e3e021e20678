use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::auth::Claims;
use crate::connection_manager::{ConnectionHandle, RegistryError, ALL_TOPICS};
use crate::events::Topic;
use crate::metrics::{ConnectionMetrics, WsMessageMetrics};
use crate::server::AppState;

use super::message::{ClientMessage, OutboundMessage, ServerMessage};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// WebSocket upgrade handler
#[tracing::instrument(
    name = "ws.upgrade",
    skip(ws, state, query, headers),
    fields(has_query_token = query.token.is_some())
)]
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(token) = extract_token(&query, &headers) else {
        return (StatusCode::UNAUTHORIZED, "Missing authentication token").into_response();
    };

    let claims = match state.jwt_validator.validate(&token) {
        Ok(claims) => claims,
        Err(e) => {
            tracing::warn!(error = %e, "JWT validation failed");
            return (StatusCode::UNAUTHORIZED, "Invalid token").into_response();
        }
    };

    tracing::info!(user_id = %claims.sub, tenant_id = %claims.tenant_id(), "WebSocket upgrade requested");

    ws.on_upgrade(move |socket| handle_socket(socket, state, claims))
}

/// Extract token from query parameter or Authorization header
fn extract_token(query: &WsQuery, headers: &HeaderMap) -> Option<String> {
    if let Some(ref token) = query.token {
        return Some(token.clone());
    }

    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn rejection_reason(error: &RegistryError) -> &'static str {
    match error {
        RegistryError::DuplicateConnection(_) => "duplicate",
        RegistryError::TotalLimitExceeded { .. } => "total_limit",
        RegistryError::UserLimitExceeded { .. } => "user_limit",
    }
}

#[tracing::instrument(
    name = "ws.connection",
    skip(socket, state, claims),
    fields(
        user_id = %claims.sub,
        tenant_id = %claims.tenant_id(),
        otel.kind = "server"
    )
)]
async fn handle_socket(socket: WebSocket, state: AppState, claims: Claims) {
    let user_id = claims.sub.clone();
    let tenant_id = claims.tenant_id().to_string();
    let connection_start = std::time::Instant::now();

    let (tx, mut rx) = mpsc::channel::<OutboundMessage>(state.settings.websocket.outbound_buffer.max(1));

    let handle = match state
        .registry
        .register(user_id.clone(), tenant_id.clone(), tx)
        .await
    {
        Ok(h) => h,
        Err(e) => {
            tracing::warn!(user_id = %user_id, error = %e, "Connection rejected");
            ConnectionMetrics::record_rejected(rejection_reason(&e));
            let (mut ws_sender, _) = socket.split();
            let error_msg = ServerMessage::error("CONNECTION_REJECTED", e.to_string());
            if let Ok(json) = serde_json::to_string(&error_msg) {
                let _ = ws_sender.send(Message::Text(json.into())).await;
            }
            let _ = ws_sender.close().await;
            return;
        }
    };
    let connection_id = handle.id;

    for org in claims.extra_organizations() {
        state.registry.add_membership(&user_id, org).await;
    }

    ConnectionMetrics::record_opened();
    tracing::info!(
        connection_id = %connection_id,
        user_id = %user_id,
        tenant_id = %tenant_id,
        "WebSocket connection established"
    );

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Frames already queued are flushed before a close request takes effect
    let send_handle = handle.clone();
    let send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to serialize message");
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = send_handle.closed() => {
                    let _ = ws_sender.close().await;
                    break;
                }
            }
        }
    });

    let state_clone = state.clone();
    let handle_clone = handle.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(msg) => {
                    if !process_message(msg, &state_clone, &handle_clone).await {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = send_task => {
            tracing::debug!(connection_id = %connection_id, "Send task completed");
        }
        _ = recv_task => {
            tracing::debug!(connection_id = %connection_id, "Receive task completed");
        }
    }

    handle.close();
    state.registry.remove(connection_id).await;

    let duration = connection_start.elapsed().as_secs_f64();
    ConnectionMetrics::record_closed(duration);

    tracing::info!(
        connection_id = %connection_id,
        user_id = %user_id,
        duration_secs = duration,
        "WebSocket connection closed"
    );
}

/// Process a received WebSocket message.
/// Returns false if the connection should be closed.
async fn process_message(msg: Message, state: &AppState, handle: &Arc<ConnectionHandle>) -> bool {
    match msg {
        Message::Text(text) => {
            handle.update_activity();

            let client_msg: ClientMessage = match serde_json::from_str(&text) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to parse client message");
                    WsMessageMetrics::record_invalid();
                    let _ = handle
                        .send(ServerMessage::error("INVALID_MESSAGE", e.to_string()))
                        .await;
                    return true;
                }
            };

            handle_client_message(client_msg, state, handle).await;
            true
        }
        Message::Binary(_) => {
            let _ = handle
                .send(ServerMessage::error(
                    "UNSUPPORTED_FORMAT",
                    "Binary messages are not supported",
                ))
                .await;
            true
        }
        Message::Ping(_) | Message::Pong(_) => {
            // Axum answers pings itself
            handle.update_activity();
            true
        }
        Message::Close(_) => {
            tracing::debug!(connection_id = %handle.id, "Received close frame");
            false
        }
    }
}

#[tracing::instrument(
    name = "ws.message",
    skip(state, handle),
    fields(
        connection_id = %handle.id,
        user_id = %handle.user_id,
        message_type = ?msg
    )
)]
async fn handle_client_message(msg: ClientMessage, state: &AppState, handle: &Arc<ConnectionHandle>) {
    match msg {
        ClientMessage::Subscribe { topics } => {
            WsMessageMetrics::record_subscribe();
            handle_subscribe(topics, state, handle).await;
        }
        ClientMessage::Unsubscribe { topics } => {
            WsMessageMetrics::record_unsubscribe();
            let removed = state.registry.unsubscribe_topics(handle.id, &topics).await;
            let _ = handle.send(ServerMessage::unsubscribed(removed)).await;
        }
        ClientMessage::Ping => {
            WsMessageMetrics::record_ping();
            let _ = handle.send(ServerMessage::Pong).await;
        }
    }
}

async fn handle_subscribe(topics: Vec<String>, state: &AppState, handle: &Arc<ConnectionHandle>) {
    let (valid, invalid): (Vec<String>, Vec<String>) =
        topics.into_iter().partition(|t| is_valid_topic_filter(t));

    let mut errors: Vec<String> = invalid
        .iter()
        .map(|t| format!("Unknown topic: {}", t))
        .collect();

    if !valid.is_empty() {
        match state.registry.subscribe_topics(handle.id, &valid).await {
            Ok(accepted) => {
                tracing::info!(
                    connection_id = %handle.id,
                    topics = ?accepted,
                    "Subscribed to topics"
                );
                let _ = handle.send(ServerMessage::subscribed(accepted)).await;
            }
            Err(e) => {
                tracing::warn!(connection_id = %handle.id, error = %e, "Failed to subscribe");
                errors.push(e);
            }
        }
    }

    if !errors.is_empty() {
        let _ = handle
            .send(ServerMessage::error("SUBSCRIPTION_ERROR", errors.join("; ")))
            .await;
    }
}

/// A topic filter is either the catch-all or a known topic name
fn is_valid_topic_filter(filter: &str) -> bool {
    filter == ALL_TOPICS || filter.parse::<Topic>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_topic_filters() {
        assert!(is_valid_topic_filter("*"));
        assert!(is_valid_topic_filter("entity-changed"));
        assert!(is_valid_topic_filter("work-item-status"));
        assert!(is_valid_topic_filter("system-notification"));
    }

    #[test]
    fn test_invalid_topic_filters() {
        assert!(!is_valid_topic_filter(""));
        assert!(!is_valid_topic_filter("EntityChanged"));
        assert!(!is_valid_topic_filter("entity-changed "));
        assert!(!is_valid_topic_filter("orders"));
    }

    #[test]
    fn test_token_from_query_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer from-header".parse().unwrap());

        let query = WsQuery {
            token: Some("from-query".into()),
        };
        assert_eq!(extract_token(&query, &headers).as_deref(), Some("from-query"));

        let query = WsQuery { token: None };
        assert_eq!(extract_token(&query, &headers).as_deref(), Some("from-header"));
        assert!(extract_token(&query, &HeaderMap::new()).is_none());
    }
}
