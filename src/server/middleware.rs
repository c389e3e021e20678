use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use super::AppState;
use crate::error::AppError;
use crate::guards::ThrottleDecision;

pub const API_KEY_HEADER: &str = "X-API-Key";

#[derive(Debug, Deserialize)]
struct CredentialQuery {
    access_token: Option<String>,
}

/// Credential presented by a publisher: `X-API-Key` header, then
/// `Authorization: Bearer`, then the `access_token` query parameter.
pub fn extract_credential(req: &Request<Body>) -> Option<String> {
    let headers = req.headers();
    if let Some(key) = header_str(headers, API_KEY_HEADER) {
        return Some(key.to_string());
    }

    if let Some(token) = header_str(headers, header::AUTHORIZATION.as_str())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return Some(token.to_string());
    }

    Query::<CredentialQuery>::try_from_uri(req.uri())
        .ok()
        .and_then(|Query(q)| q.access_token)
        .filter(|t| !t.is_empty())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

/// Runs the guard pipeline (API key, then throttling) in front of publishing
/// routes.
///
/// Admitted requests carry the [`crate::guards::Admission`] as a request
/// extension and get `X-RateLimit-*` headers on the response. Rejections are
/// answered directly with 401 or 429.
pub async fn guard_middleware(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let credential = extract_credential(&req);

    let admission = match state.guards.admit(credential.as_deref()) {
        Ok(admission) => admission,
        Err(e) => {
            tracing::warn!(
                path = %req.uri().path(),
                error = %e,
                "Request rejected by guard pipeline"
            );
            return AppError::from(e).into_response();
        }
    };

    let throttle = admission.throttle;
    req.extensions_mut().insert(admission);
    let mut response = next.run(req).await;

    if let ThrottleDecision::Allowed {
        remaining,
        limit,
        reset_at,
    } = throttle
    {
        let headers = response.headers_mut();
        if let Ok(v) = HeaderValue::from_str(&limit.to_string()) {
            headers.insert("X-RateLimit-Limit", v);
        }
        if let Ok(v) = HeaderValue::from_str(&remaining.to_string()) {
            headers.insert("X-RateLimit-Remaining", v);
        }
        if let Ok(v) = HeaderValue::from_str(&reset_at.to_string()) {
            headers.insert("X-RateLimit-Reset", v);
        }
    }

    response
}
