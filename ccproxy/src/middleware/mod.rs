//! HTTP middleware: request logging, CORS, and bearer-key authentication.
//!
//! Trimmed from the teacher's stack of six middleware layers down to the
//! three this crate needs: the JWT/session/plugin/metrics layers are gone,
//! `auth_middleware` now compares a single configured API key instead of
//! delegating to an `AuthService`.

use crate::gateway_error::GatewayError;
use crate::server::AppState;
use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::http::{self};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};

/// Logs method, URI, status, and latency for every request.
pub async fn logging_middleware(req: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().clone();

    let request_id = req
        .extensions()
        .get::<crate::request_context::RequestContext>()
        .map(|ctx| ctx.request_id.clone())
        .unwrap_or_else(|| "unknown".to_string());

    let response = next.run(req).await;

    let latency = start.elapsed();
    let status = response.status();

    tracing::info!(
        request_id = %request_id,
        method = %method,
        uri = %uri,
        status = %status,
        latency_ms = latency.as_millis(),
        "request processed"
    );

    response
}

/// Compares the `Authorization: Bearer <key>` header against the
/// configured API key. An empty configured key disables the check.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    if req.method() == http::Method::OPTIONS {
        return next.run(req).await;
    }

    if state.config.apikey.is_empty() {
        return next.run(req).await;
    }

    let presented = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .or_else(|| {
            req.headers()
                .get("x-api-key")
                .and_then(|h| h.to_str().ok())
        });

    match presented {
        Some(key) if key == state.config.apikey => {
            req.extensions_mut()
                .insert(crate::request_context::RequestContext::with_auth(Some(key.to_string())));
            next.run(req).await
        }
        _ => GatewayError::AuthFailed.into_response(),
    }
}

pub fn cors_middleware() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}
