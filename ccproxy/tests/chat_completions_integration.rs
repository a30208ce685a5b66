//! End-to-end pipeline tests against a mocked upstream provider, following
//! the teacher's `wiremock` + `axum-test` dev-dependency pairing: `wiremock`
//! stands in for the provider, `axum-test` drives the real router/handler
//! stack in front of it.

use axum_test::TestServer;
use ccproxy::config::{Config, RouteConfig};
use ccproxy::create_server;
use ccproxy_core::provider::Provider;
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_for(base_url: String, model: &str) -> Config {
    let mut config = Config::default();
    config.providers.push(Provider {
        name: "openai".to_string(),
        api_base_url: base_url,
        api_key: "test-key".to_string(),
        enabled: true,
        models: vec![model.to_string()],
        timeout: Duration::from_secs(5),
        max_tokens_limit: None,
    });
    config.routes.insert(
        "default".to_string(),
        RouteConfig {
            provider: "openai".to_string(),
            model: model.to_string(),
            parameters: Default::default(),
        },
    );
    config
}

#[tokio::test]
async fn chat_completions_round_trips_through_openai_transformer() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1_700_000_000,
            "model": "gpt-4",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "hello back"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}
        })))
        .mount(&mock_server)
        .await;

    let config = config_for(mock_server.uri(), "gpt-4");
    let app = create_server(config).await.unwrap();
    let server = TestServer::new(app).unwrap();

    let response = server
        .post("/v1/chat/completions")
        .json(&json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["choices"][0]["message"]["content"], "hello back");
}

#[tokio::test]
async fn messages_endpoint_translates_anthropic_dialect_through_openai_provider() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-2",
            "object": "chat.completion",
            "created": 1_700_000_000,
            "model": "gpt-4",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "hi from anthropic dialect"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 3, "completion_tokens": 4, "total_tokens": 7}
        })))
        .mount(&mock_server)
        .await;

    let config = config_for(mock_server.uri(), "gpt-4");
    let app = create_server(config).await.unwrap();
    let server = TestServer::new(app).unwrap();

    let response = server
        .post("/v1/messages")
        .json(&json!({
            "model": "gpt-4",
            "max_tokens": 256,
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["content"][0]["text"], "hi from anthropic dialect");
}

#[tokio::test]
async fn upstream_error_surfaces_as_bad_gateway() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "error": {"message": "internal error"}
        })))
        .mount(&mock_server)
        .await;

    let config = config_for(mock_server.uri(), "gpt-4");
    let app = create_server(config).await.unwrap();
    let server = TestServer::new(app).unwrap();

    let response = server
        .post("/v1/chat/completions")
        .json(&json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .await;

    assert_eq!(response.status_code(), axum::http::StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn rate_limit_rejects_burst_beyond_configured_capacity() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-3",
            "object": "chat.completion",
            "created": 1_700_000_000,
            "model": "gpt-4",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "ok"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2}
        })))
        .mount(&mock_server)
        .await;

    let mut config = config_for(mock_server.uri(), "gpt-4");
    config.performance.rate_limit_per_minute = 60;
    config.performance.rate_limit_burst = 1;

    let app = create_server(config).await.unwrap();
    let server = TestServer::new(app).unwrap();

    let first = server
        .post("/v1/chat/completions")
        .json(&json!({"model": "gpt-4", "messages": [{"role": "user", "content": "hi"}]}))
        .await;
    first.assert_status_ok();

    let second = server
        .post("/v1/chat/completions")
        .json(&json!({"model": "gpt-4", "messages": [{"role": "user", "content": "hi"}]}))
        .await;
    assert_eq!(second.status_code(), axum::http::StatusCode::TOO_MANY_REQUESTS);
}
