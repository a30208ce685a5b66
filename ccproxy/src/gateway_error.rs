//! Gateway-facing error taxonomy and its HTTP response mapping.
//!
//! Kept the teacher's `IntoResponse` shape (status + JSON `{error: {message,
//! type, code}}` body) but replaced the variant set entirely: the client-SDK
//! and content-filtering/cache/plugin variants are gone, replaced by the
//! route/provider/transformer/rate-limit/circuit/upstream taxonomy this
//! crate's error design calls for.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use ccproxy_core::error::ProviderError;
use ccproxy_core::provider::SelectError;
use serde_json::json;
use thiserror::Error;

use crate::router::RouteError;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("configuration error: {field} - {reason}")]
    Config { field: String, reason: String },

    #[error("no route matched the request")]
    RouteUnmatched,

    #[error("route references a provider that is not configured")]
    ProviderMissing,

    #[error("route's provider is disabled")]
    ProviderDisabled,

    #[error("no provider declares model {model}")]
    NoProviderForModel { model: String },

    #[error("all providers for model {model} are unhealthy")]
    AllUnhealthy { model: String },

    #[error("no transformer registered for provider {provider}")]
    TransformerMissing { provider: String },

    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("circuit open for provider {provider}")]
    CircuitOpen { provider: String },

    #[error("upstream request timed out")]
    UpstreamTimeout,

    #[error("upstream network error: {0}")]
    UpstreamNetwork(String),

    #[error("upstream returned {code}")]
    UpstreamHttp { code: u16, body: String },

    #[error("authentication failed")]
    AuthFailed,

    #[error("request body too large")]
    RequestTooLarge,

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl From<RouteError> for GatewayError {
    fn from(err: RouteError) -> Self {
        match err {
            RouteError::RouteUnmatched => GatewayError::RouteUnmatched,
            RouteError::ProviderMissing => GatewayError::ProviderMissing,
            RouteError::ProviderDisabled => GatewayError::ProviderDisabled,
        }
    }
}

impl From<SelectError> for GatewayError {
    fn from(err: SelectError) -> Self {
        match err {
            SelectError::NoProviderForModel { model } => GatewayError::NoProviderForModel { model },
            SelectError::AllUnhealthy { model } => GatewayError::AllUnhealthy { model },
        }
    }
}

impl From<ProviderError> for GatewayError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Http(e) if e.is_timeout() => GatewayError::UpstreamTimeout,
            ProviderError::Http(e) => GatewayError::UpstreamNetwork(e.to_string()),
            ProviderError::Api { code, message } => GatewayError::UpstreamHttp { code, body: message },
            ProviderError::InvalidApiKey => GatewayError::AuthFailed,
            ProviderError::ModelNotFound { model } => GatewayError::NoProviderForModel { model },
            ProviderError::RateLimit => GatewayError::RateLimited { retry_after_secs: None },
            ProviderError::ServiceUnavailable => GatewayError::UpstreamNetwork("service unavailable".into()),
            ProviderError::Timeout => GatewayError::UpstreamTimeout,
            ProviderError::Serialization(e) => GatewayError::Internal { message: e.to_string() },
            ProviderError::InvalidResponse => GatewayError::UpstreamHttp {
                code: 502,
                body: "invalid response format".to_string(),
            },
            ProviderError::Configuration { message } => GatewayError::Config {
                field: "provider".to_string(),
                reason: message,
            },
            ProviderError::TransformerMissing { provider } => GatewayError::TransformerMissing { provider },
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            GatewayError::Config { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "config_error"),
            GatewayError::RouteUnmatched => (StatusCode::BAD_REQUEST, "route_unmatched"),
            GatewayError::ProviderMissing => (StatusCode::SERVICE_UNAVAILABLE, "provider_missing"),
            GatewayError::ProviderDisabled => (StatusCode::SERVICE_UNAVAILABLE, "provider_disabled"),
            GatewayError::NoProviderForModel { .. } => (StatusCode::BAD_REQUEST, "no_provider_for_model"),
            GatewayError::AllUnhealthy { .. } => (StatusCode::SERVICE_UNAVAILABLE, "all_unhealthy"),
            GatewayError::TransformerMissing { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "transformer_missing")
            }
            GatewayError::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
            GatewayError::CircuitOpen { .. } => (StatusCode::SERVICE_UNAVAILABLE, "circuit_open"),
            GatewayError::UpstreamTimeout => (StatusCode::GATEWAY_TIMEOUT, "upstream_timeout"),
            GatewayError::UpstreamNetwork(_) => (StatusCode::BAD_GATEWAY, "upstream_network"),
            // A 5xx from the upstream is surfaced as 502 rather than
            // republished verbatim; non-5xx codes pass through as reported.
            GatewayError::UpstreamHttp { code, .. } if *code >= 500 => {
                (StatusCode::BAD_GATEWAY, "upstream_http")
            }
            GatewayError::UpstreamHttp { code, .. } => (
                StatusCode::from_u16(*code).unwrap_or(StatusCode::BAD_GATEWAY),
                "upstream_http",
            ),
            GatewayError::AuthFailed => (StatusCode::UNAUTHORIZED, "auth_failed"),
            GatewayError::RequestTooLarge => (StatusCode::PAYLOAD_TOO_LARGE, "request_too_large"),
            GatewayError::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        if let GatewayError::TransformerMissing { provider } = &self {
            tracing::error!(provider = %provider, "transformer missing for registered provider");
        }

        let body = json!({
            "error": {
                "message": self.to_string(),
                "type": error_type,
                "code": status.as_u16()
            }
        });

        let mut response = (status, Json(body)).into_response();

        if let GatewayError::RateLimited {
            retry_after_secs: Some(secs),
        } = &self
        {
            if let Ok(value) = axum::http::HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert("Retry-After", value);
            }
        }

        response
    }
}
