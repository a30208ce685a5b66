//! Client-facing wire codecs.
//!
//! `/v1/chat/completions` speaks the OpenAI dialect, which is exactly the
//! shape of [`crate::envelope`] already, so that side of this module is a
//! thin serde pass-through. `/v1/messages` speaks the Anthropic "Messages"
//! dialect, which folds `system` and content blocks onto the envelope's
//! flat `Message` list. Grounded on the message-folding logic the
//! Anthropic transformer uses for the provider-facing wire, reused here
//! for the client-facing wire since both are the same dialect.

use crate::envelope::{
    ChatRequest, ChatResponse, ClientDialect, Delta, FunctionCall, Message, Role, StreamChoice,
    StreamChunk, Tool, ToolCall, Usage,
};
use crate::error::ProviderError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub fn decode_request(dialect: ClientDialect, body: &[u8]) -> Result<ChatRequest, ProviderError> {
    match dialect {
        ClientDialect::OpenAi => {
            let mut request: ChatRequest = serde_json::from_slice(body)?;
            request.dialect = ClientDialect::OpenAi;
            Ok(request)
        }
        ClientDialect::Anthropic => {
            let wire: AnthropicWireRequest = serde_json::from_slice(body)?;
            Ok(wire.into_envelope())
        }
    }
}

/// `ChatResponse` carries no dialect tag of its own; the caller threads the
/// originating request's dialect through explicitly so this knows which
/// wire to produce.
pub fn encode_response(
    dialect: ClientDialect,
    response: &ChatResponse,
) -> Result<Vec<u8>, ProviderError> {
    match dialect {
        ClientDialect::OpenAi => Ok(serde_json::to_vec(response)?),
        ClientDialect::Anthropic => {
            let wire = AnthropicWireResponse::from_envelope(response);
            Ok(serde_json::to_vec(&wire)?)
        }
    }
}

pub fn encode_stream_event(dialect: ClientDialect, chunk: &StreamChunk) -> Vec<u8> {
    match dialect {
        ClientDialect::OpenAi => {
            let data = serde_json::to_string(chunk).unwrap_or_default();
            format!("data: {data}\n\n").into_bytes()
        }
        ClientDialect::Anthropic => {
            let event = AnthropicStreamEvent::from_chunk(chunk);
            let data = serde_json::to_string(&event).unwrap_or_default();
            format!("event: {}\ndata: {data}\n\n", event.event_name()).into_bytes()
        }
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicWireRequest {
    model: String,
    #[serde(default)]
    system: Option<AnthropicSystem>,
    messages: Vec<AnthropicWireMessage>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    top_p: Option<f32>,
    #[serde(default)]
    stream: Option<bool>,
    #[serde(default)]
    stop_sequences: Option<Vec<String>>,
    #[serde(default)]
    tools: Option<Vec<AnthropicToolDef>>,
    #[serde(default)]
    thinking: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AnthropicSystem {
    Text(String),
    Blocks(Vec<AnthropicBlock>),
}

impl AnthropicSystem {
    fn into_text(self) -> String {
        match self {
            AnthropicSystem::Text(s) => s,
            AnthropicSystem::Blocks(blocks) => blocks
                .into_iter()
                .filter_map(|b| b.text)
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicWireMessage {
    role: String,
    content: AnthropicContent,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AnthropicContent {
    Text(String),
    Blocks(Vec<AnthropicBlock>),
}

#[derive(Debug, Deserialize)]
struct AnthropicBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<Value>,
    #[serde(default)]
    tool_use_id: Option<String>,
    #[serde(default)]
    content: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct AnthropicToolDef {
    name: String,
    #[serde(default)]
    description: Option<String>,
    input_schema: Value,
}

impl AnthropicWireRequest {
    fn into_envelope(self) -> ChatRequest {
        let mut messages = Vec::new();
        if let Some(system) = self.system {
            let text = system.into_text();
            if !text.is_empty() {
                messages.push(Message::system(text));
            }
        }

        for msg in self.messages {
            let role = match msg.role.as_str() {
                "user" => Role::User,
                "assistant" => Role::Assistant,
                other => {
                    tracing::warn!("unrecognized anthropic message role: {other}");
                    Role::User
                }
            };

            match msg.content {
                AnthropicContent::Text(text) => messages.push(Message {
                    role,
                    content: text,
                    name: None,
                    tool_calls: None,
                    tool_call_id: None,
                }),
                AnthropicContent::Blocks(blocks) => {
                    let mut text = String::new();
                    let mut tool_calls = Vec::new();
                    let mut tool_call_id = None;

                    for block in blocks {
                        match block.block_type.as_str() {
                            "text" => {
                                if let Some(t) = block.text {
                                    if !text.is_empty() {
                                        text.push('\n');
                                    }
                                    text.push_str(&t);
                                }
                            }
                            "tool_use" => {
                                tool_calls.push(ToolCall {
                                    id: block.id.unwrap_or_default(),
                                    call_type: "function".to_string(),
                                    function: FunctionCall {
                                        name: block.name.unwrap_or_default(),
                                        arguments: block
                                            .input
                                            .map(|v| v.to_string())
                                            .unwrap_or_else(|| "{}".to_string()),
                                    },
                                });
                            }
                            "tool_result" => {
                                tool_call_id = block.tool_use_id;
                                if let Some(content) = block.content {
                                    text.push_str(&content.to_string());
                                }
                            }
                            _ => {}
                        }
                    }

                    messages.push(Message {
                        role,
                        content: text,
                        name: None,
                        tool_calls: if tool_calls.is_empty() {
                            None
                        } else {
                            Some(tool_calls)
                        },
                        tool_call_id,
                    });
                }
            }
        }

        let tools = self.tools.map(|tools| {
            tools
                .into_iter()
                .map(|t| Tool {
                    tool_type: "function".to_string(),
                    function: crate::envelope::Function {
                        name: t.name,
                        description: t.description,
                        parameters: t.input_schema,
                    },
                })
                .collect()
        });

        ChatRequest {
            model: self.model,
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream: self.stream,
            tools,
            tool_choice: None,
            top_p: self.top_p,
            stop: self.stop_sequences,
            dialect: ClientDialect::Anthropic,
            thinking: self.thinking.is_some(),
            background: false,
        }
    }
}

#[derive(Debug, Serialize)]
struct AnthropicWireResponse {
    id: String,
    #[serde(rename = "type")]
    response_type: &'static str,
    role: &'static str,
    content: Vec<AnthropicOutBlock>,
    model: String,
    stop_reason: Option<String>,
    usage: AnthropicWireUsage,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum AnthropicOutBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
}

#[derive(Debug, Serialize)]
struct AnthropicWireUsage {
    input_tokens: u32,
    output_tokens: u32,
}

impl AnthropicWireResponse {
    fn from_envelope(response: &ChatResponse) -> Self {
        let choice = response.choices.first();
        let mut content = Vec::new();

        if let Some(choice) = choice {
            if !choice.message.content.is_empty() {
                content.push(AnthropicOutBlock::Text {
                    text: choice.message.content.clone(),
                });
            }
            if let Some(tool_calls) = &choice.message.tool_calls {
                for call in tool_calls {
                    content.push(AnthropicOutBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.function.name.clone(),
                        input: serde_json::from_str(&call.function.arguments)
                            .unwrap_or(Value::Null),
                    });
                }
            }
        }

        let usage = response.usage.unwrap_or(Usage::default());

        Self {
            id: response.id.clone(),
            response_type: "message",
            role: "assistant",
            content,
            model: response.model.clone(),
            stop_reason: choice.and_then(|c| c.finish_reason.clone()),
            usage: AnthropicWireUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum AnthropicStreamEvent {
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { index: u32, delta: AnthropicDelta },
    #[serde(rename = "message_stop")]
    MessageStop,
}

#[derive(Debug, Serialize)]
struct AnthropicDelta {
    #[serde(rename = "type")]
    delta_type: &'static str,
    text: String,
}

impl AnthropicStreamEvent {
    fn from_chunk(chunk: &StreamChunk) -> Self {
        let choice = chunk.choices.first();
        match choice {
            Some(StreamChoice {
                delta: Delta { content: Some(text), .. },
                index,
                ..
            }) => AnthropicStreamEvent::ContentBlockDelta {
                index: *index,
                delta: AnthropicDelta {
                    delta_type: "text_delta",
                    text: text.clone(),
                },
            },
            _ => AnthropicStreamEvent::MessageStop,
        }
    }

    fn event_name(&self) -> &'static str {
        match self {
            AnthropicStreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            AnthropicStreamEvent::MessageStop => "message_stop",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_anthropic_request_with_system_and_text() {
        let body = br#"{
            "model": "claude-3-5-sonnet-20241022",
            "system": "Be terse.",
            "max_tokens": 256,
            "messages": [{"role": "user", "content": "hi"}]
        }"#;
        let req = decode_request(ClientDialect::Anthropic, body).unwrap();
        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.messages[0].role, Role::System);
        assert_eq!(req.messages[1].content, "hi");
        assert_eq!(req.dialect, ClientDialect::Anthropic);
    }

    #[test]
    fn decodes_anthropic_request_with_content_blocks() {
        let body = br#"{
            "model": "claude-3-5-sonnet-20241022",
            "max_tokens": 256,
            "messages": [{"role": "user", "content": [{"type": "text", "text": "hello"}]}]
        }"#;
        let req = decode_request(ClientDialect::Anthropic, body).unwrap();
        assert_eq!(req.messages[0].content, "hello");
    }

    #[test]
    fn decodes_openai_request_directly() {
        let body = br#"{"model": "gpt-4", "messages": [{"role": "user", "content": "hi"}]}"#;
        let req = decode_request(ClientDialect::OpenAi, body).unwrap();
        assert_eq!(req.model, "gpt-4");
        assert_eq!(req.dialect, ClientDialect::OpenAi);
    }

    #[test]
    fn encodes_anthropic_response_with_text_block() {
        let response = ChatResponse {
            id: "msg_1".to_string(),
            object: "chat.completion".to_string(),
            created: 0,
            model: "claude-3-5-sonnet-20241022".to_string(),
            choices: vec![crate::envelope::Choice {
                index: 0,
                message: Message::assistant("hello back"),
                finish_reason: Some("end_turn".to_string()),
                logprobs: None,
            }],
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
            system_fingerprint: None,
        };
        let bytes = encode_response(ClientDialect::Anthropic, &response).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["content"][0]["text"], "hello back");
        assert_eq!(value["usage"]["input_tokens"], 10);
    }
}
