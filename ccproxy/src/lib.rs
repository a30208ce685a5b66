//! CCProxy: a routing and reliability layer in front of several LLM
//! providers, accepting both Anthropic-dialect and OpenAI-dialect chat
//! requests and translating them through a per-provider transformer.

pub mod config;
pub mod gateway_error;
pub mod handlers;
pub mod middleware;
pub mod process;
pub mod rate_limiter;
pub mod request_context;
pub mod router;
pub mod server;
pub mod state;

pub use server::create_server;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::http::StatusCode;
    use axum_test::TestServer;
    use ccproxy_core::provider::Provider;
    use std::time::Duration;

    fn config_with_openai() -> Config {
        let mut config = Config::default();
        config.providers.push(Provider {
            name: "openai".to_string(),
            api_base_url: "https://api.openai.com/v1".to_string(),
            api_key: "test-key".to_string(),
            enabled: true,
            models: vec!["gpt-4".to_string()],
            timeout: Duration::from_secs(30),
            max_tokens_limit: None,
        });
        config.routes.insert(
            "default".to_string(),
            crate::config::RouteConfig {
                provider: "openai".to_string(),
                model: "gpt-4".to_string(),
                parameters: Default::default(),
            },
        );
        config
    }

    #[tokio::test]
    async fn health_endpoint_is_always_ok() {
        let app = create_server(config_with_openai()).await.unwrap();
        let server = TestServer::new(app).unwrap();
        let response = server.get("/health").await;
        assert_eq!(response.status_code(), StatusCode::OK);
    }

    #[tokio::test]
    async fn status_endpoint_reports_ready_components() {
        let app = create_server(config_with_openai()).await.unwrap();
        let server = TestServer::new(app).unwrap();
        let response = server.get("/status").await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let body = response.json::<serde_json::Value>();
        assert_eq!(body["state"], "ready");
    }

    #[tokio::test]
    async fn chat_completions_without_matching_route_is_rejected() {
        let mut config = config_with_openai();
        let default_route = config.routes.remove("default").unwrap();
        config.routes.insert("gpt-4".to_string(), default_route);

        let app = create_server(config).await.unwrap();
        let server = TestServer::new(app).unwrap();
        let response = server
            .post("/v1/chat/completions")
            .json(&serde_json::json!({
                "model": "unrouted-model",
                "messages": [{"role": "user", "content": "hi"}]
            }))
            .await;
        assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn auth_middleware_rejects_missing_bearer_when_apikey_set() {
        let mut config = config_with_openai();
        config.apikey = "secret".to_string();
        let app = create_server(config).await.unwrap();
        let server = TestServer::new(app).unwrap();
        let response = server
            .post("/v1/chat/completions")
            .json(&serde_json::json!({
                "model": "gpt-4",
                "messages": [{"role": "user", "content": "hi"}]
            }))
            .await;
        assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
    }
}
