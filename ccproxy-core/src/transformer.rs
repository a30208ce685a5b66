//! Bidirectional provider transformers, registered by provider name.
//!
//! Each transformer is a stateless bundle of six functions translating
//! between the canonical envelope and one provider's wire dialect. None of
//! them perform I/O; the request pipeline (`ccproxy::handlers`) owns the
//! outbound call and the client-facing response write.
//!
//! `AnthropicTransformer` is grounded on the teacher's Anthropic
//! message-folding and streaming parse logic; `OpenAiTransformer` is close
//! to a pass-through since the canonical envelope is OpenAI-shaped.

use crate::envelope::{
    ChatRequest, ChatResponse, Choice, ClientDialect, Delta, Message, Role, StreamChoice,
    StreamChunk, Usage,
};
use crate::error::ProviderError;
use dashmap::DashMap;
use reqwest::header::HeaderMap;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// What a transformer's `request_out` hands the outbound HTTP client.
#[derive(Debug)]
pub struct OutboundRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

pub trait Transformer: Send + Sync {
    fn name(&self) -> &str;

    /// Canonicalize on ingress. Identity by default.
    fn request_in(&self, envelope: ChatRequest) -> ChatRequest {
        envelope
    }

    fn request_out(&self, envelope: &ChatRequest) -> Result<OutboundRequest, ProviderError>;

    fn response_in(&self, status: u16, body: &[u8]) -> Result<ChatResponse, ProviderError>;

    /// Serialize to the client wire. `dialect` is the dialect the original
    /// request arrived in, since `ChatResponse` carries no dialect of its
    /// own.
    fn response_out(
        &self,
        response: &ChatResponse,
        dialect: ClientDialect,
    ) -> Result<Vec<u8>, ProviderError> {
        crate::dialect::encode_response(dialect, response)
    }

    /// Parse one arrival of provider stream bytes into zero or more
    /// canonical chunks. May be called repeatedly as more bytes arrive;
    /// a transformer must not assume a single call sees the whole stream.
    fn stream_event_in(&self, chunk_bytes: &[u8]) -> Vec<Result<StreamChunk, ProviderError>>;

    fn stream_event_out(&self, event: &StreamChunk, dialect: ClientDialect) -> Vec<u8> {
        crate::dialect::encode_stream_event(dialect, event)
    }
}

/// Transformers registered at startup, keyed by provider name. Looking up a
/// provider with no registered transformer is a programming error, not a
/// user error: the caller should treat a miss as `transformer-missing`.
#[derive(Default)]
pub struct TransformerRegistry {
    transformers: DashMap<String, Arc<dyn Transformer>>,
}

impl TransformerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, provider_name: impl Into<String>, transformer: Arc<dyn Transformer>) {
        self.transformers.insert(provider_name.into(), transformer);
    }

    pub fn get(&self, provider_name: &str) -> Option<Arc<dyn Transformer>> {
        self.transformers.get(provider_name).map(|e| e.clone())
    }
}

// ---------------------------------------------------------------------
// Anthropic transformer: envelope <-> the Anthropic Messages API wire.
// ---------------------------------------------------------------------

pub struct AnthropicTransformer;

#[derive(Debug, Serialize)]
struct AnthropicOutRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicOutMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Serialize)]
struct AnthropicOutMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicInResponse {
    id: String,
    content: Vec<AnthropicInContent>,
    model: String,
    stop_reason: Option<String>,
    usage: AnthropicInUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicInContent {
    #[serde(rename = "type")]
    #[allow(dead_code)]
    content_type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicInUsage {
    input_tokens: u32,
    output_tokens: u32,
}

fn split_system(messages: &[Message]) -> (Option<String>, Vec<AnthropicOutMessage>) {
    let mut system = String::new();
    let mut out = Vec::new();

    for msg in messages {
        match msg.role {
            Role::System => {
                if !system.is_empty() {
                    system.push('\n');
                }
                system.push_str(&msg.content);
            }
            Role::User => out.push(AnthropicOutMessage {
                role: "user".to_string(),
                content: msg.content.clone(),
            }),
            Role::Assistant => out.push(AnthropicOutMessage {
                role: "assistant".to_string(),
                content: msg.content.clone(),
            }),
            Role::Tool => continue,
        }
    }

    (if system.is_empty() { None } else { Some(system) }, out)
}

impl Transformer for AnthropicTransformer {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn request_out(&self, envelope: &ChatRequest) -> Result<OutboundRequest, ProviderError> {
        let (system, messages) = split_system(&envelope.messages);
        let wire = AnthropicOutRequest {
            model: envelope.model.clone(),
            max_tokens: envelope.max_tokens.unwrap_or(4096),
            messages,
            system,
            temperature: envelope.temperature,
            stream: envelope.stream,
        };

        let mut headers = HeaderMap::new();
        headers.insert("anthropic-version", "2023-06-01".parse().unwrap());
        headers.insert("content-type", "application/json".parse().unwrap());

        Ok(OutboundRequest {
            method: Method::POST,
            path: "/v1/messages".to_string(),
            headers,
            body: serde_json::to_vec(&wire)?,
        })
    }

    fn response_in(&self, _status: u16, body: &[u8]) -> Result<ChatResponse, ProviderError> {
        let parsed: AnthropicInResponse = serde_json::from_slice(body)?;
        let content = parsed
            .content
            .into_iter()
            .filter_map(|c| c.text)
            .collect::<Vec<_>>()
            .join("");

        Ok(ChatResponse {
            id: parsed.id,
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp() as u64,
            model: parsed.model,
            choices: vec![Choice {
                index: 0,
                message: Message::assistant(content),
                finish_reason: parsed.stop_reason,
                logprobs: None,
            }],
            usage: Some(Usage {
                prompt_tokens: parsed.usage.input_tokens,
                completion_tokens: parsed.usage.output_tokens,
                total_tokens: parsed.usage.input_tokens + parsed.usage.output_tokens,
            }),
            system_fingerprint: None,
        })
    }

    fn stream_event_in(&self, chunk_bytes: &[u8]) -> Vec<Result<StreamChunk, ProviderError>> {
        let text = String::from_utf8_lossy(chunk_bytes);
        let mut out = Vec::new();

        for line in text.lines() {
            let Some(json_str) = line.trim().strip_prefix("data: ") else {
                continue;
            };
            if json_str == "[DONE]" {
                continue;
            }
            match serde_json::from_str::<serde_json::Value>(json_str) {
                Ok(event) => {
                    if let Some(text) = event
                        .get("delta")
                        .and_then(|d| d.get("text"))
                        .and_then(|t| t.as_str())
                    {
                        out.push(Ok(StreamChunk {
                            id: event
                                .get("id")
                                .and_then(|v| v.as_str())
                                .unwrap_or("anthropic-stream")
                                .to_string(),
                            object: "chat.completion.chunk".to_string(),
                            created: chrono::Utc::now().timestamp() as u64,
                            model: event
                                .get("model")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            choices: vec![StreamChoice {
                                index: 0,
                                delta: Delta {
                                    role: None,
                                    content: Some(text.to_string()),
                                    tool_calls: None,
                                },
                                finish_reason: None,
                            }],
                            usage: None,
                        }));
                    }
                }
                Err(e) => out.push(Err(ProviderError::Serialization(e))),
            }
        }

        out
    }
}

// ---------------------------------------------------------------------
// OpenAI transformer: the envelope already is this wire shape.
// ---------------------------------------------------------------------

pub struct OpenAiTransformer;

impl Transformer for OpenAiTransformer {
    fn name(&self) -> &str {
        "openai"
    }

    fn request_out(&self, envelope: &ChatRequest) -> Result<OutboundRequest, ProviderError> {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/json".parse().unwrap());

        Ok(OutboundRequest {
            method: Method::POST,
            path: "/chat/completions".to_string(),
            headers,
            body: serde_json::to_vec(envelope)?,
        })
    }

    fn response_in(&self, _status: u16, body: &[u8]) -> Result<ChatResponse, ProviderError> {
        Ok(serde_json::from_slice(body)?)
    }

    fn stream_event_in(&self, chunk_bytes: &[u8]) -> Vec<Result<StreamChunk, ProviderError>> {
        let text = String::from_utf8_lossy(chunk_bytes);
        let mut out = Vec::new();

        for line in text.lines() {
            let Some(json_str) = line.trim().strip_prefix("data: ") else {
                continue;
            };
            if json_str == "[DONE]" {
                continue;
            }
            match serde_json::from_str::<StreamChunk>(json_str) {
                Ok(chunk) => out.push(Ok(chunk)),
                Err(e) => out.push(Err(ProviderError::Serialization(e))),
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Message;

    #[test]
    fn anthropic_request_out_splits_system_message() {
        let transformer = AnthropicTransformer;
        let envelope = ChatRequest {
            model: "claude-3-5-sonnet-20241022".to_string(),
            messages: vec![Message::system("be terse"), Message::user("hi")],
            max_tokens: Some(100),
            ..ChatRequest::default()
        };
        let out = transformer.request_out(&envelope).unwrap();
        let body: serde_json::Value = serde_json::from_slice(&out.body).unwrap();
        assert_eq!(body["system"], "be terse");
        assert_eq!(body["messages"][0]["content"], "hi");
        assert_eq!(out.path, "/v1/messages");
    }

    #[test]
    fn anthropic_response_in_joins_text_blocks() {
        let transformer = AnthropicTransformer;
        let body = br#"{
            "id": "msg_1",
            "content": [{"type": "text", "text": "hello"}],
            "model": "claude-3-5-sonnet-20241022",
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 3, "output_tokens": 2}
        }"#;
        let response = transformer.response_in(200, body).unwrap();
        assert_eq!(response.choices[0].message.content, "hello");
        assert_eq!(response.usage.unwrap().total_tokens, 5);
    }

    #[test]
    fn openai_request_out_is_direct_serialization() {
        let transformer = OpenAiTransformer;
        let envelope = ChatRequest {
            model: "gpt-4".to_string(),
            messages: vec![Message::user("hi")],
            ..ChatRequest::default()
        };
        let out = transformer.request_out(&envelope).unwrap();
        let body: serde_json::Value = serde_json::from_slice(&out.body).unwrap();
        assert_eq!(body["model"], "gpt-4");
    }

    #[test]
    fn registry_returns_none_for_unknown_provider() {
        let registry = TransformerRegistry::new();
        registry.register("anthropic", Arc::new(AnthropicTransformer));
        assert!(registry.get("openai").is_none());
        assert!(registry.get("anthropic").is_some());
    }
}
