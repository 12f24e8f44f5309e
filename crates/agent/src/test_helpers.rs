//! Shared test support: scripted and flaky model clients.
//!
//! Kept as a normal module (not `#[cfg(test)]`) so integration tests and
//! downstream crates can drive the loop without a live provider.

use std::sync::Mutex;

use async_trait::async_trait;

use deepnest_core::error::ModelError;
use deepnest_core::message::Block;
use deepnest_core::model::{ModelClient, ModelRequest, ModelResponse, StopReason, Usage};

/// A mock model client that returns a sequence of scripted responses.
///
/// Each call to `complete` returns the next response in the queue.
/// Panics if more calls are made than responses provided.
pub struct ScriptedModel {
    responses: Mutex<Vec<ModelResponse>>,
    calls: Mutex<usize>,
}

impl ScriptedModel {
    pub fn new(responses: Vec<ModelResponse>) -> Self {
        Self {
            responses: Mutex::new(responses),
            calls: Mutex::new(0),
        }
    }

    /// A model that answers once with plain text.
    pub fn single_text(text: &str) -> Self {
        Self::new(vec![text_response(text)])
    }

    /// A model that first requests tools, then answers with text.
    pub fn tool_then_answer(uses: Vec<Block>, thought: &str, answer: &str) -> Self {
        Self::new(vec![tool_use_response(uses, thought), text_response(answer)])
    }

    /// How many completions have been served.
    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _request: ModelRequest) -> Result<ModelResponse, ModelError> {
        let mut calls = self.calls.lock().unwrap();
        let responses = self.responses.lock().unwrap();
        if *calls >= responses.len() {
            panic!(
                "ScriptedModel: no more responses (call #{}, have {})",
                *calls,
                responses.len()
            );
        }
        let response = responses[*calls].clone();
        *calls += 1;
        Ok(response)
    }
}

/// Fails the first `failures` completions with a transient error, then
/// delegates to an inner scripted model.
pub struct FlakyModel {
    failures: Mutex<usize>,
    inner: ScriptedModel,
}

impl FlakyModel {
    pub fn new(failures: usize, inner: ScriptedModel) -> Self {
        Self {
            failures: Mutex::new(failures),
            inner,
        }
    }
}

#[async_trait]
impl ModelClient for FlakyModel {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(ModelError::Api {
                    status_code: 503,
                    message: "temporarily overloaded".into(),
                });
            }
        }
        self.inner.complete(request).await
    }
}

/// Build a text-only terminal response.
pub fn text_response(text: &str) -> ModelResponse {
    ModelResponse {
        blocks: vec![Block::text(text)],
        stop: StopReason::EndTurn,
        usage: Some(Usage {
            input_tokens: 10,
            output_tokens: 5,
        }),
        model: "mock-model".into(),
    }
}

/// Build a response that requests the given tool uses.
pub fn tool_use_response(uses: Vec<Block>, thought: &str) -> ModelResponse {
    let mut blocks = Vec::new();
    if !thought.is_empty() {
        blocks.push(Block::text(thought));
    }
    blocks.extend(uses);
    ModelResponse {
        blocks,
        stop: StopReason::ToolUse,
        usage: Some(Usage {
            input_tokens: 10,
            output_tokens: 5,
        }),
        model: "mock-model".into(),
    }
}

/// Helper to build a tool-use block.
pub fn tool_use(id: &str, name: &str, input: serde_json::Value) -> Block {
    Block::ToolUse {
        id: id.into(),
        name: name.into(),
        input,
    }
}
