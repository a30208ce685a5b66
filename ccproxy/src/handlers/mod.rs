//! HTTP handlers implementing the request pipeline (§4.6): decode, route,
//! gate, transform, call upstream, transform back.
//!
//! Grounded on the teacher's `chat_completions`/`stream_chat_completions`
//! handler pair for the overall shape (state extraction, streaming via SSE,
//! `GatewayError` as the handler error type) but rebuilt end to end around
//! the router/provider-service/transformer pipeline instead of the SDK
//! client.

use crate::gateway_error::GatewayError;
use crate::request_context::RequestContext;
use crate::router::{self, ProviderAvailability, RoutingRequest};
use crate::server::AppState;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use ccproxy_core::envelope::{estimate_tokens, model_implies_background, model_implies_thinking, ClientDialect};
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Instant;

pub async fn messages(
    state: State<AppState>,
    req: axum::extract::Request,
) -> Result<Response, GatewayError> {
    handle(state, req, ClientDialect::Anthropic).await
}

pub async fn chat_completions(
    state: State<AppState>,
    req: axum::extract::Request,
) -> Result<Response, GatewayError> {
    handle(state, req, ClientDialect::OpenAi).await
}

async fn handle(
    State(state): State<AppState>,
    req: axum::extract::Request,
    dialect: ClientDialect,
) -> Result<Response, GatewayError> {
    let client_key = req
        .extensions()
        .get::<RequestContext>()
        .and_then(|ctx| ctx.api_key.clone())
        .unwrap_or_else(|| "anonymous".to_string());

    let body = axum::body::to_bytes(req.into_body(), state.config.performance.max_request_body_size)
        .await
        .map_err(|_| GatewayError::RequestTooLarge)?;

    let mut request = ccproxy_core::dialect::decode_request(dialect, &body)?;
    request.dialect = dialect;

    let token_count = estimate_tokens(&request);
    request.background = request.background || model_implies_background(&request.model);
    request.thinking = request.thinking || model_implies_thinking(&request.model);

    let routing_request = RoutingRequest {
        model: request.model.clone(),
        token_count,
        thinking: request.thinking,
        background: request.background,
    };

    let availability: HashMap<String, bool> = state
        .providers
        .all()
        .await
        .into_iter()
        .map(|p| (p.name, p.enabled))
        .collect();

    let decision = router::route(
        &routing_request,
        &state.config.routes,
        &ProviderAvailability(&availability),
    )?;

    let provider = state
        .providers
        .get(&decision.provider_name)
        .await
        .ok_or(GatewayError::ProviderMissing)?;

    let rate_limit_key = format!("{client_key}:{}", provider.name);
    if state.config.performance.rate_limit_enabled && !state.rate_limiter.allow(&rate_limit_key).await {
        return Err(GatewayError::RateLimited { retry_after_secs: Some(1) });
    }

    let breaker = state.circuit_breaker_for(&provider.name);
    if state.config.performance.circuit_breaker_enabled && !breaker.allow().await {
        return Err(GatewayError::CircuitOpen { provider: provider.name.clone() });
    }

    let merged = router::merge_parameters(
        &decision.parameters,
        &caller_overrides(&request),
        provider.max_tokens_limit,
    );
    apply_merged_parameters(&mut request, &merged);
    request.model = decision.model;

    let transformer = state
        .transformers
        .get(&provider.name)
        .ok_or_else(|| GatewayError::TransformerMissing { provider: provider.name.clone() })?;

    let outbound = transformer.request_out(&request)?;
    let url = format!(
        "{}{}",
        provider.api_base_url.trim_end_matches('/'),
        outbound.path
    );

    let deadline = state.config.performance.request_timeout.min(provider.timeout);
    let builder = state
        .http_client
        .request(outbound.method.clone(), &url)
        .headers(outbound.headers.clone())
        .header("Authorization", format!("Bearer {}", provider.api_key))
        .header("Content-Type", "application/json")
        .timeout(deadline)
        .body(outbound.body.clone());

    let started = Instant::now();

    if request.stream.unwrap_or(false) {
        return stream_response(state, provider.name.clone(), breaker, transformer, builder, dialect, started).await;
    }

    let send_result = builder.send().await;
    let latency = started.elapsed();

    let resp = match send_result {
        Ok(resp) => resp,
        Err(err) => {
            breaker.record(false).await;
            state
                .providers
                .record_error(&provider.name, false, latency, err.to_string())
                .await;
            return Err(if err.is_timeout() {
                GatewayError::UpstreamTimeout
            } else {
                GatewayError::UpstreamNetwork(err.to_string())
            });
        }
    };

    let status = resp.status();
    let body_bytes = resp
        .bytes()
        .await
        .map_err(|e| GatewayError::UpstreamNetwork(e.to_string()))?;

    if !status.is_success() {
        let retryable = matches!(status.as_u16(), 408 | 429) || status.is_server_error();
        tracing::warn!(provider = %provider.name, status = %status, retryable, "upstream returned non-2xx");
        breaker.record(false).await;
        state
            .providers
            .record_error(
                &provider.name,
                false,
                latency,
                String::from_utf8_lossy(&body_bytes).to_string(),
            )
            .await;
        return Err(GatewayError::UpstreamHttp {
            code: status.as_u16(),
            body: String::from_utf8_lossy(&body_bytes).to_string(),
        });
    }

    let response = transformer.response_in(status.as_u16(), &body_bytes)?;
    breaker.record(true).await;
    state.providers.record(&provider.name, true, latency).await;

    let wire = transformer.response_out(&response, dialect)?;
    Ok((
        StatusCode::OK,
        [("content-type", "application/json")],
        wire,
    )
        .into_response())
}

async fn stream_response(
    state: AppState,
    provider_name: String,
    breaker: std::sync::Arc<ccproxy_core::circuit_breaker::CircuitBreaker>,
    transformer: std::sync::Arc<dyn ccproxy_core::transformer::Transformer>,
    builder: reqwest::RequestBuilder,
    dialect: ClientDialect,
    started: Instant,
) -> Result<Response, GatewayError> {
    let resp = match builder.send().await {
        Ok(resp) => resp,
        Err(err) => {
            breaker.record(false).await;
            state
                .providers
                .record_error(&provider_name, false, started.elapsed(), err.to_string())
                .await;
            return Err(if err.is_timeout() {
                GatewayError::UpstreamTimeout
            } else {
                GatewayError::UpstreamNetwork(err.to_string())
            });
        }
    };

    let status = resp.status();
    if !status.is_success() {
        let body = resp.bytes().await.unwrap_or_default();
        breaker.record(false).await;
        state
            .providers
            .record_error(
                &provider_name,
                false,
                started.elapsed(),
                String::from_utf8_lossy(&body).to_string(),
            )
            .await;
        return Err(GatewayError::UpstreamHttp {
            code: status.as_u16(),
            body: String::from_utf8_lossy(&body).to_string(),
        });
    }

    breaker.record(true).await;
    state.providers.record(&provider_name, true, started.elapsed()).await;

    let upstream = resp.bytes_stream();
    let stream = upstream.map(move |chunk| match chunk {
        Ok(bytes) => {
            let mut out = Vec::new();
            for parsed in transformer.stream_event_in(&bytes) {
                match parsed {
                    Ok(event) => out.extend(transformer.stream_event_out(&event, dialect)),
                    Err(err) => tracing::debug!(%err, "dropped unparsable stream chunk"),
                }
            }
            Ok::<Bytes, std::io::Error>(Bytes::from(out))
        }
        Err(err) => Err(std::io::Error::new(std::io::ErrorKind::Other, err.to_string())),
    });

    let mut response = Response::new(Body::from_stream(stream));
    response
        .headers_mut()
        .insert("content-type", HeaderValue::from_static("text/event-stream"));
    Ok(response)
}

fn caller_overrides(request: &ccproxy_core::envelope::ChatRequest) -> HashMap<String, Value> {
    let mut overrides = HashMap::new();
    if let Some(max_tokens) = request.max_tokens {
        overrides.insert("max_tokens".to_string(), Value::from(max_tokens));
    }
    if let Some(temperature) = request.temperature {
        overrides.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = request.top_p {
        overrides.insert("top_p".to_string(), json!(top_p));
    }
    overrides
}

fn apply_merged_parameters(
    request: &mut ccproxy_core::envelope::ChatRequest,
    merged: &HashMap<String, Value>,
) {
    if let Some(v) = merged.get("max_tokens").and_then(|v| v.as_u64()) {
        request.max_tokens = Some(v as u32);
    }
    if let Some(v) = merged.get("temperature").and_then(|v| v.as_f64()) {
        request.temperature = Some(v as f32);
    }
    if let Some(v) = merged.get("top_p").and_then(|v| v.as_f64()) {
        request.top_p = Some(v as f32);
    }
}

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub async fn status(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.state_manager.snapshot().await;
    Json(json!({
        "state": snapshot.state,
        "uptime_secs": snapshot.uptime_secs,
        "components": snapshot.components.into_iter().map(|(name, state)| json!({"component": name, "state": state})).collect::<Vec<_>>(),
        "error_count": snapshot.error_count,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccproxy_core::envelope::{ChatRequest, Message};

    #[test]
    fn caller_overrides_picks_up_set_fields_only() {
        let mut request = ChatRequest::default();
        request.max_tokens = Some(512);
        request.messages.push(Message::user("hi"));
        let overrides = caller_overrides(&request);
        assert_eq!(overrides.get("max_tokens"), Some(&Value::from(512)));
        assert!(!overrides.contains_key("temperature"));
    }

    #[test]
    fn apply_merged_parameters_writes_back_onto_request() {
        let mut request = ChatRequest::default();
        let mut merged = HashMap::new();
        merged.insert("max_tokens".to_string(), Value::from(256));
        apply_merged_parameters(&mut request, &merged);
        assert_eq!(request.max_tokens, Some(256));
    }
}
