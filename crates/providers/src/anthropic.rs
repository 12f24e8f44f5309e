//! Anthropic native model client.
//!
//! Speaks the Messages API directly:
//! - `x-api-key` header authentication (not Bearer)
//! - `anthropic-version` header
//! - System prompt as a top-level field
//! - Native tool use with `tool_use` / `tool_result` content blocks
//! - Streaming via SSE with `content_block_delta` events
//!
//! The domain `Block` model maps one-to-one onto the wire content blocks,
//! so conversion in both directions is mostly renaming.

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use deepnest_core::error::ModelError;
use deepnest_core::message::{Block, Message, Role, ToolResultStatus};
use deepnest_core::model::{
    ModelClient, ModelRequest, ModelResponse, StopReason, StreamEvent, Usage,
};

use crate::pacer::RequestPacer;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const HTTP_TIMEOUT: Duration = Duration::from_secs(300);

/// Anthropic Messages API client.
pub struct AnthropicClient {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    pacer: Option<Arc<RequestPacer>>,
}

impl AnthropicClient {
    /// Create a new client.
    pub fn new(api_key: impl Into<String>) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| ModelError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            name: "anthropic".into(),
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
            client,
            pacer: None,
        })
    }

    /// Use a custom base URL (testing, proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Enforce a minimum interval between requests through this client.
    pub fn with_min_time_between_calls(mut self, interval: Duration) -> Self {
        self.pacer = Some(Arc::new(RequestPacer::new(interval)));
        self
    }

    fn build_body(request: &ModelRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": to_api_messages(&request.messages),
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });
        if !request.system.is_empty() {
            body["system"] = serde_json::json!(request.system);
        }
        if !request.tools.is_empty() {
            let tools: Vec<serde_json::Value> = request
                .tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.input_schema,
                    })
                })
                .collect();
            body["tools"] = serde_json::json!(tools);
        }
        if stream {
            body["stream"] = serde_json::json!(true);
        }
        body
    }

    async fn post(
        &self,
        body: &serde_json::Value,
        accept_sse: bool,
    ) -> Result<reqwest::Response, ModelError> {
        if let Some(pacer) = &self.pacer {
            pacer.pace().await;
        }

        let url = format!("{}/v1/messages", self.base_url);
        let mut request = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json");
        if accept_sse {
            request = request.header("Accept", "text/event-stream");
        }

        let response = request.json(body).send().await.map_err(|e| {
            if e.is_timeout() {
                ModelError::Timeout(e.to_string())
            } else {
                ModelError::Network(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        match status {
            200 => Ok(response),
            401 | 403 => Err(ModelError::Auth("Invalid Anthropic API key".into())),
            429 => {
                let retry_after_secs = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(5);
                Err(ModelError::RateLimited { retry_after_secs })
            }
            400 => {
                let message = response.text().await.unwrap_or_default();
                Err(ModelError::InvalidRequest(message))
            }
            _ => {
                let message = response.text().await.unwrap_or_default();
                warn!(status, body = %message, "Anthropic API error");
                Err(ModelError::Api {
                    status_code: status,
                    message,
                })
            }
        }
    }
}

#[async_trait]
impl ModelClient for AnthropicClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        debug!(model = %request.model, messages = request.messages.len(), "Sending completion request");

        let body = Self::build_body(&request, false);
        let response = self.post(&body, false).await?;

        let api_response: ApiResponse = response.json().await.map_err(|e| ModelError::Api {
            status_code: 200,
            message: format!("failed to parse Anthropic response: {e}"),
        })?;

        to_model_response(api_response)
    }

    async fn stream(
        &self,
        request: ModelRequest,
    ) -> Result<tokio::sync::mpsc::Receiver<Result<StreamEvent, ModelError>>, ModelError> {
        debug!(model = %request.model, "Sending streaming request");

        let body = Self::build_body(&request, true);
        let response = self.post(&body, true).await?;

        let (tx, rx) = tokio::sync::mpsc::channel(64);

        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut usage: Option<Usage> = None;
            let mut stop: Option<StopReason> = None;

            while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(Err(ModelError::Stream(e.to_string()))).await;
                        return;
                    }
                };

                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim_end_matches('\r').to_string();
                    buffer = buffer[line_end + 1..].to_string();

                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    let data = data.trim();
                    if data.is_empty() {
                        continue;
                    }

                    let event: serde_json::Value = match serde_json::from_str(data) {
                        Ok(value) => value,
                        Err(e) => {
                            trace!(error = %e, data = %data, "Ignoring unparseable SSE line");
                            continue;
                        }
                    };

                    for out in sse_to_events(&event, &mut usage, &mut stop) {
                        if tx.send(Ok(out)).await.is_err() {
                            return;
                        }
                    }

                    if event["type"].as_str() == Some("message_stop") {
                        let reason = stop.unwrap_or(StopReason::EndTurn);
                        let _ = tx
                            .send(Ok(StreamEvent::Stop {
                                reason,
                                usage: usage.take(),
                            }))
                            .await;
                        return;
                    }
                }
            }

            // The connection closed before message_stop.
            let _ = tx
                .send(Err(ModelError::Stream(
                    "stream closed before message_stop".into(),
                )))
                .await;
        });

        Ok(rx)
    }
}

/// Translate one SSE payload into zero or more stream events, folding
/// usage and stop-reason bookkeeping into the provided slots.
fn sse_to_events(
    event: &serde_json::Value,
    usage: &mut Option<Usage>,
    stop: &mut Option<StopReason>,
) -> Vec<StreamEvent> {
    match event["type"].as_str().unwrap_or("") {
        "message_start" => {
            if let Some(input) = event["message"]["usage"]["input_tokens"].as_u64() {
                *usage = Some(Usage {
                    input_tokens: input as u32,
                    output_tokens: 0,
                });
            }
            vec![]
        }
        "content_block_start" => {
            let block = &event["content_block"];
            match block["type"].as_str() {
                Some("tool_use") => vec![StreamEvent::ToolUseStart {
                    id: block["id"].as_str().unwrap_or("").to_string(),
                    name: block["name"].as_str().unwrap_or("").to_string(),
                }],
                _ => vec![],
            }
        }
        "content_block_delta" => {
            let delta = &event["delta"];
            match delta["type"].as_str().unwrap_or("") {
                "text_delta" => delta["text"]
                    .as_str()
                    .map(|text| StreamEvent::TextDelta {
                        text: text.to_string(),
                    })
                    .into_iter()
                    .collect(),
                "input_json_delta" => delta["partial_json"]
                    .as_str()
                    .map(|partial| StreamEvent::ToolUseInputDelta {
                        partial_json: partial.to_string(),
                    })
                    .into_iter()
                    .collect(),
                _ => vec![],
            }
        }
        "content_block_stop" => vec![StreamEvent::BlockEnd],
        "message_delta" => {
            if let Some(reason) = event["delta"]["stop_reason"].as_str() {
                *stop = Some(parse_stop_reason(reason));
            }
            if let Some(output) = event["usage"]["output_tokens"].as_u64() {
                let input = usage.map(|u| u.input_tokens).unwrap_or(0);
                *usage = Some(Usage {
                    input_tokens: input,
                    output_tokens: output as u32,
                });
            }
            vec![]
        }
        _ => vec![],
    }
}

fn parse_stop_reason(raw: &str) -> StopReason {
    match raw {
        "tool_use" => StopReason::ToolUse,
        "max_tokens" => StopReason::MaxTokens,
        _ => StopReason::EndTurn,
    }
}

/// Render a tool-result payload the way the API expects: plain strings
/// pass through, anything structured is serialized.
fn payload_text(payload: &serde_json::Value) -> String {
    match payload {
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn to_api_messages(messages: &[Message]) -> Vec<ApiMessage> {
    messages
        .iter()
        .map(|message| {
            let role = match message.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            let content: Vec<ApiBlock> = message
                .content
                .iter()
                .map(|block| match block {
                    Block::Text { text } => ApiBlock::Text { text: text.clone() },
                    Block::ToolUse { id, name, input } => ApiBlock::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        input: input.clone(),
                    },
                    Block::ToolResult {
                        id,
                        status,
                        payload,
                    } => ApiBlock::ToolResult {
                        tool_use_id: id.clone(),
                        content: payload_text(payload),
                        is_error: *status == ToolResultStatus::Error,
                    },
                })
                .collect();
            ApiMessage {
                role: role.into(),
                content,
            }
        })
        .collect()
}

fn to_model_response(response: ApiResponse) -> Result<ModelResponse, ModelError> {
    let blocks: Vec<Block> = response
        .content
        .into_iter()
        .map(|block| match block {
            ApiResponseBlock::Text { text } => Block::Text { text },
            ApiResponseBlock::ToolUse { id, name, input } => Block::ToolUse { id, name, input },
        })
        .collect();

    let stop = response
        .stop_reason
        .as_deref()
        .map(parse_stop_reason)
        .unwrap_or(StopReason::EndTurn);

    Ok(ModelResponse {
        blocks,
        stop,
        usage: Some(Usage {
            input_tokens: response.usage.input_tokens,
            output_tokens: response.usage.output_tokens,
        }),
        model: response.model,
    })
}

// --- Anthropic API types ---

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: String,
    content: Vec<ApiBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    model: String,
    content: Vec<ApiResponseBlock>,
    usage: ApiUsage,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructor_defaults() {
        let client = AnthropicClient::new("sk-ant-test").unwrap();
        assert_eq!(client.name(), "anthropic");
        assert_eq!(client.base_url, DEFAULT_BASE_URL);
    }

    #[test]
    fn base_url_trailing_slash_trimmed() {
        let client = AnthropicClient::new("sk-ant-test")
            .unwrap()
            .with_base_url("https://proxy.example.com/");
        assert_eq!(client.base_url, "https://proxy.example.com");
    }

    #[test]
    fn message_conversion_covers_all_block_kinds() {
        let messages = vec![
            Message::user_text("Hello"),
            Message::assistant(vec![
                Block::text("Checking"),
                Block::ToolUse {
                    id: "toolu_1".into(),
                    name: "read_file".into(),
                    input: serde_json::json!({"path": "a.txt"}),
                },
            ]),
            Message::tool_results(vec![Block::tool_error("toolu_1", "file not found")]),
        ];

        let api = to_api_messages(&messages);
        assert_eq!(api.len(), 3);
        assert_eq!(api[0].role, "user");
        assert_eq!(api[1].role, "assistant");
        assert_eq!(api[2].role, "user");

        match &api[2].content[0] {
            ApiBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                assert_eq!(tool_use_id, "toolu_1");
                assert_eq!(content, "file not found");
                assert!(is_error);
            }
            other => panic!("expected tool_result, got {other:?}"),
        }
    }

    #[test]
    fn structured_payloads_are_serialized() {
        assert_eq!(payload_text(&serde_json::json!("plain")), "plain");
        assert_eq!(
            payload_text(&serde_json::json!({"k": 1})),
            r#"{"k":1}"#
        );
    }

    #[test]
    fn parse_text_response() {
        let api: ApiResponse = serde_json::from_str(
            r#"{
                "model": "claude-sonnet-4-5",
                "content": [{"type": "text", "text": "Hello!"}],
                "usage": {"input_tokens": 10, "output_tokens": 5},
                "stop_reason": "end_turn"
            }"#,
        )
        .unwrap();

        let response = to_model_response(api).unwrap();
        assert_eq!(response.blocks, vec![Block::text("Hello!")]);
        assert_eq!(response.stop, StopReason::EndTurn);
        assert_eq!(response.usage.unwrap().input_tokens, 10);
    }

    #[test]
    fn parse_tool_use_response() {
        let api: ApiResponse = serde_json::from_str(
            r#"{
                "model": "claude-sonnet-4-5",
                "content": [
                    {"type": "text", "text": "Let me check"},
                    {"type": "tool_use", "id": "toolu_abc", "name": "list_files", "input": {}}
                ],
                "usage": {"input_tokens": 20, "output_tokens": 10},
                "stop_reason": "tool_use"
            }"#,
        )
        .unwrap();

        let response = to_model_response(api).unwrap();
        assert_eq!(response.stop, StopReason::ToolUse);
        assert_eq!(
            response.blocks[1],
            Block::ToolUse {
                id: "toolu_abc".into(),
                name: "list_files".into(),
                input: serde_json::json!({}),
            }
        );
    }

    #[test]
    fn sse_event_translation() {
        let mut usage = None;
        let mut stop = None;

        let start: serde_json::Value = serde_json::json!({
            "type": "message_start",
            "message": {"usage": {"input_tokens": 42}}
        });
        assert!(sse_to_events(&start, &mut usage, &mut stop).is_empty());
        assert_eq!(usage.unwrap().input_tokens, 42);

        let tool_start: serde_json::Value = serde_json::json!({
            "type": "content_block_start",
            "content_block": {"type": "tool_use", "id": "toolu_1", "name": "probe"}
        });
        let events = sse_to_events(&tool_start, &mut usage, &mut stop);
        assert_eq!(
            events,
            vec![StreamEvent::ToolUseStart {
                id: "toolu_1".into(),
                name: "probe".into()
            }]
        );

        let delta: serde_json::Value = serde_json::json!({
            "type": "content_block_delta",
            "delta": {"type": "input_json_delta", "partial_json": "{\"x\":"}
        });
        let events = sse_to_events(&delta, &mut usage, &mut stop);
        assert_eq!(
            events,
            vec![StreamEvent::ToolUseInputDelta {
                partial_json: "{\"x\":".into()
            }]
        );

        let message_delta: serde_json::Value = serde_json::json!({
            "type": "message_delta",
            "delta": {"stop_reason": "tool_use"},
            "usage": {"output_tokens": 7}
        });
        sse_to_events(&message_delta, &mut usage, &mut stop);
        assert_eq!(stop, Some(StopReason::ToolUse));
        assert_eq!(usage.unwrap().output_tokens, 7);
    }

    #[test]
    fn stop_reason_parsing() {
        assert_eq!(parse_stop_reason("tool_use"), StopReason::ToolUse);
        assert_eq!(parse_stop_reason("max_tokens"), StopReason::MaxTokens);
        assert_eq!(parse_stop_reason("end_turn"), StopReason::EndTurn);
        assert_eq!(parse_stop_reason("anything_else"), StopReason::EndTurn);
    }
}
