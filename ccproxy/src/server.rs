//! HTTP server assembly: shared state, middleware stack, and routing.
//!
//! `AppState` is trimmed to the components the request pipeline actually
//! needs (config, provider registry, transformer registry, rate limiter,
//! per-provider circuit breakers, a shared HTTP client, and the state
//! manager) — the teacher's SDK client/plugin manager/cache manager/
//! WebSocket manager are all gone.

use crate::config::Config;
use crate::handlers;
use crate::middleware::{auth_middleware, cors_middleware, logging_middleware};
use crate::rate_limiter::{RateLimitConfig, RateLimiter};
use crate::state::StateManager;
use axum::{
    routing::{get, post},
    Router,
};
use ccproxy_core::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use ccproxy_core::provider::ProviderService;
use ccproxy_core::transformer::{AnthropicTransformer, OpenAiTransformer, TransformerRegistry};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::timeout::TimeoutLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub providers: Arc<ProviderService>,
    pub transformers: Arc<TransformerRegistry>,
    pub rate_limiter: Arc<RateLimiter>,
    pub circuit_breakers: Arc<DashMap<String, Arc<CircuitBreaker>>>,
    pub http_client: reqwest::Client,
    pub state_manager: StateManager,
}

impl AppState {
    pub fn circuit_breaker_for(&self, provider: &str) -> Arc<CircuitBreaker> {
        self.circuit_breakers
            .entry(provider.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    provider.to_string(),
                    CircuitBreakerConfig::default(),
                ))
            })
            .clone()
    }
}

pub async fn create_server(config: Config) -> anyhow::Result<Router> {
    let providers = Arc::new(ProviderService::new());
    providers.refresh(config.providers.clone()).await;

    let transformers = Arc::new(TransformerRegistry::new());
    transformers.register("anthropic", Arc::new(AnthropicTransformer));
    transformers.register("openai", Arc::new(OpenAiTransformer));
    for provider in &config.providers {
        if transformers.get(&provider.name).is_none() {
            transformers.register(provider.name.clone(), Arc::new(OpenAiTransformer));
        }
    }

    let rate_limiter = Arc::new(RateLimiter::new(RateLimitConfig {
        requests_per_minute: config.performance.rate_limit_per_minute,
        burst: config.performance.rate_limit_burst,
    }));

    let http_client = reqwest::Client::builder()
        .min_tls_version(reqwest::tls::Version::TLS_1_2)
        .build()?;

    let state_manager = StateManager::new();
    state_manager.register("router");
    state_manager.register("providers");
    state_manager.register("rate_limiter");
    state_manager.register("circuit_breakers");
    for component in ["router", "providers", "rate_limiter", "circuit_breakers"] {
        state_manager
            .set_state(component, crate::state::ComponentState::Ready)
            .await;
    }

    let state = AppState {
        config: Arc::new(config),
        providers,
        transformers,
        rate_limiter,
        circuit_breakers: Arc::new(DashMap::new()),
        http_client,
        state_manager,
    };

    if !state.config.apikey.is_empty() {
        tracing::info!("bearer authentication enabled");
    } else {
        tracing::warn!("apikey is empty; authentication is disabled");
    }

    spawn_health_probe_loop(
        state.providers.clone(),
        state.http_client.clone(),
        state.config.performance.health_check_interval,
    );
    spawn_rate_limiter_cleanup(state.rate_limiter.clone());

    // `/health` and `/status` bypass the bearer gate — they report process
    // liveness and must stay reachable regardless of auth configuration.
    let protected = Router::new()
        .route("/v1/messages", post(handlers::messages))
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let public = Router::new()
        .route("/health", get(handlers::health))
        .route("/status", get(handlers::status));

    let app = protected
        .merge(public)
        .layer(
            ServiceBuilder::new()
                .layer(CatchPanicLayer::new())
                .layer(cors_middleware())
                .layer(axum::middleware::from_fn(logging_middleware))
                .layer(TimeoutLayer::new(Duration::from_secs(
                    state.config.performance.request_timeout.as_secs() + 5,
                ))),
        )
        .with_state(state);

    Ok(app)
}

/// Periodically probes every enabled provider and feeds the outcome into
/// the registry's health bookkeeping, the same way the request path does.
fn spawn_health_probe_loop(
    providers: Arc<ProviderService>,
    http_client: reqwest::Client,
    interval: Duration,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            providers.probe_all(&http_client).await;
        }
    });
}

/// Periodically evicts rate limiter buckets idle past their retention
/// window, so a long-running process doesn't accumulate one bucket per
/// distinct client key forever.
fn spawn_rate_limiter_cleanup(rate_limiter: Arc<RateLimiter>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            rate_limiter.cleanup();
        }
    });
}
