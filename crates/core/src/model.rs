//! ModelClient trait — the abstraction over tool-using model backends.
//!
//! A client knows how to send a transcript view to a model and get back an
//! ordered list of content blocks, either whole or as a stream of events.
//! The driver consumes only whole blocks; [`BlockAssembler`] is the one
//! place stream events are folded into blocks, in emission order.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::message::{Block, Message};
use crate::tool::ToolSchema;

/// Why the model stopped emitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Terminal answer; the turn is over
    EndTurn,
    /// The model is waiting for tool results
    ToolUse,
    /// Output token budget hit
    MaxTokens,
}

/// Token usage statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// One request to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRequest {
    /// The model to use (e.g., "claude-sonnet-4-5")
    pub model: String,

    /// System prompt — a top-level field, never a message
    pub system: String,

    /// The transcript view
    pub messages: Vec<Message>,

    /// Tools the model may call
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSchema>,

    /// Maximum tokens to generate
    pub max_tokens: u32,

    /// Temperature (0.0 = deterministic)
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_temperature() -> f32 {
    0.7
}

/// A complete (non-streaming) model response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResponse {
    /// Content blocks in emission order
    pub blocks: Vec<Block>,

    /// Why the model stopped
    pub stop: StopReason,

    /// Token usage, when the provider reports it
    pub usage: Option<Usage>,

    /// Which model actually responded
    pub model: String,
}

/// A single event in a streaming response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Partial text for the current text block
    TextDelta { text: String },

    /// A tool-use block opened
    ToolUseStart { id: String, name: String },

    /// Partial JSON for the current tool-use block's input
    ToolUseInputDelta { partial_json: String },

    /// The current block closed
    BlockEnd,

    /// The stream is over
    Stop {
        reason: StopReason,
        usage: Option<Usage>,
    },
}

/// The core model client trait.
///
/// The agent loop calls `complete()` or `stream()` without knowing which
/// backend is in use. Implementations must be safe for concurrent callers;
/// one client instance is shared by the lead and every sub-agent.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// A human-readable name for this client (e.g., "anthropic", "mock").
    fn name(&self) -> &str;

    /// Send a request and get a complete response.
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, ModelError>;

    /// Send a request and get a stream of events.
    ///
    /// Default implementation calls `complete()` and synthesizes the
    /// corresponding event sequence, one whole block at a time.
    async fn stream(
        &self,
        request: ModelRequest,
    ) -> Result<tokio::sync::mpsc::Receiver<Result<StreamEvent, ModelError>>, ModelError> {
        let response = self.complete(request).await?;
        let (tx, rx) = tokio::sync::mpsc::channel(32);
        tokio::spawn(async move {
            for block in response.blocks {
                let events = match block {
                    Block::Text { text } => vec![StreamEvent::TextDelta { text }],
                    Block::ToolUse { id, name, input } => vec![
                        StreamEvent::ToolUseStart { id, name },
                        StreamEvent::ToolUseInputDelta {
                            partial_json: input.to_string(),
                        },
                    ],
                    // Tool results never appear in a model response.
                    Block::ToolResult { .. } => continue,
                };
                for event in events {
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
                if tx.send(Ok(StreamEvent::BlockEnd)).await.is_err() {
                    return;
                }
            }
            let _ = tx
                .send(Ok(StreamEvent::Stop {
                    reason: response.stop,
                    usage: response.usage,
                }))
                .await;
        });
        Ok(rx)
    }
}

/// Folds a stream of events into whole blocks, preserving emission order.
///
/// Feed events with [`push`](Self::push), then call
/// [`finish`](Self::finish). A stream that ends mid-block or without a
/// stop reason is reported as a transient stream error so the driver's
/// retry policy applies.
#[derive(Debug, Default)]
pub struct BlockAssembler {
    blocks: Vec<Block>,
    current: Option<PendingBlock>,
    stop: Option<StopReason>,
    usage: Option<Usage>,
}

#[derive(Debug)]
enum PendingBlock {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        input_json: String,
    },
}

impl BlockAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: StreamEvent) -> Result<(), ModelError> {
        match event {
            StreamEvent::TextDelta { text } => match &mut self.current {
                Some(PendingBlock::Text(buffer)) => buffer.push_str(&text),
                None => self.current = Some(PendingBlock::Text(text)),
                Some(PendingBlock::ToolUse { .. }) => {
                    return Err(ModelError::Stream(
                        "text delta inside an open tool-use block".into(),
                    ));
                }
            },
            StreamEvent::ToolUseStart { id, name } => {
                if self.current.is_some() {
                    return Err(ModelError::Stream(
                        "tool-use start before previous block ended".into(),
                    ));
                }
                self.current = Some(PendingBlock::ToolUse {
                    id,
                    name,
                    input_json: String::new(),
                });
            }
            StreamEvent::ToolUseInputDelta { partial_json } => match &mut self.current {
                Some(PendingBlock::ToolUse { input_json, .. }) => {
                    input_json.push_str(&partial_json);
                }
                _ => {
                    return Err(ModelError::Stream(
                        "input delta outside a tool-use block".into(),
                    ));
                }
            },
            StreamEvent::BlockEnd => {
                let pending = self.current.take().ok_or_else(|| {
                    ModelError::Stream("block end without an open block".into())
                })?;
                self.blocks.push(Self::close(pending)?);
            }
            StreamEvent::Stop { reason, usage } => {
                self.stop = Some(reason);
                self.usage = usage;
            }
        }
        Ok(())
    }

    fn close(pending: PendingBlock) -> Result<Block, ModelError> {
        match pending {
            PendingBlock::Text(text) => Ok(Block::Text { text }),
            PendingBlock::ToolUse {
                id,
                name,
                input_json,
            } => {
                // An empty accumulation means a no-argument call.
                let input = if input_json.trim().is_empty() {
                    serde_json::json!({})
                } else {
                    serde_json::from_str(&input_json).map_err(|e| {
                        ModelError::Stream(format!("tool input is not valid JSON: {e}"))
                    })?
                };
                Ok(Block::ToolUse { id, name, input })
            }
        }
    }

    pub fn finish(self) -> Result<(Vec<Block>, StopReason, Option<Usage>), ModelError> {
        if self.current.is_some() {
            return Err(ModelError::Stream("stream ended mid-block".into()));
        }
        let stop = self
            .stop
            .ok_or_else(|| ModelError::Stream("stream ended without a stop reason".into()))?;
        Ok((self.blocks, stop, self.usage))
    }
}
