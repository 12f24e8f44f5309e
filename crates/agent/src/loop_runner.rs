//! The reason-act loop implementation.
//!
//! One turn: append the user message, ask the model for a completion over
//! the transcript view, append the assistant message, dispatch any tool
//! uses through the executor, append the ordered results as the next user
//! message, and go again until the model stops requesting tools or a
//! budget runs out.
//!
//! Batches are strictly serial: the next model call never starts until the
//! current batch's tool-result message has been appended. Transient model
//! errors are retried with backoff and leave no trace in the transcript —
//! the pending assistant message was never appended.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use deepnest_core::error::{Error, ModelError};
use deepnest_core::message::{Block, Message};
use deepnest_core::model::{
    BlockAssembler, ModelClient, ModelRequest, ModelResponse, StopReason, StreamEvent,
};
use deepnest_core::state::StateCell;
use deepnest_core::transcript::Transcript;

use crate::executor::ToolExecutor;
use crate::stream_event::AgentStreamEvent;

const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(10);
const BACKOFF_JITTER_MS: u64 = 250;

/// Why a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStop {
    /// The model produced a terminal answer
    Complete,
    /// The per-turn step cap was hit
    StepBudgetExhausted,
}

/// The result of one completed turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// Concatenated text of the final assistant message
    pub final_text: String,

    pub stop: TurnStop,

    /// Model calls made this turn
    pub steps: usize,

    /// Tool calls dispatched this turn
    pub tool_calls_made: usize,
}

/// The core loop that orchestrates model calls and tool execution.
pub struct AgentLoop {
    model: Arc<dyn ModelClient>,

    /// Model identifier passed through to the client
    model_id: String,

    /// System prompt — sent as a top-level request field
    system_prompt: String,

    executor: ToolExecutor,

    /// Maximum model calls per turn
    max_steps: usize,

    /// Retries for transient model errors
    retries: usize,

    /// Per model request deadline
    model_timeout: Duration,

    /// End-to-end turn deadline
    turn_timeout: Duration,

    /// Max tokens per completion
    max_tokens: u32,

    temperature: f32,
}

impl AgentLoop {
    pub fn new(
        model: Arc<dyn ModelClient>,
        model_id: impl Into<String>,
        system_prompt: impl Into<String>,
        executor: ToolExecutor,
    ) -> Self {
        Self {
            model,
            model_id: model_id.into(),
            system_prompt: system_prompt.into(),
            executor,
            max_steps: 50,
            retries: 3,
            model_timeout: Duration::from_secs(60),
            turn_timeout: Duration::from_secs(300),
            max_tokens: 4096,
            temperature: 0.7,
        }
    }

    pub fn with_max_steps(mut self, max: usize) -> Self {
        self.max_steps = max.max(1);
        self
    }

    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_model_timeout(mut self, timeout: Duration) -> Self {
        self.model_timeout = timeout;
        self
    }

    pub fn with_turn_timeout(mut self, timeout: Duration) -> Self {
        self.turn_timeout = timeout;
        self
    }

    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = max;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn executor(&self) -> &ToolExecutor {
        &self.executor
    }

    /// Drive one turn to completion.
    ///
    /// The transcript always ends at a well-formed boundary: on success the
    /// last message is an assistant message; on cancellation or turn
    /// timeout it is either the state before the pending assistant message
    /// or the state after a fully appended tool-result message.
    pub async fn run_turn(
        &self,
        transcript: &mut Transcript,
        state: &StateCell,
        user_text: &str,
        session_id: Option<String>,
        cancel: &CancellationToken,
        events: Option<&mpsc::Sender<AgentStreamEvent>>,
    ) -> Result<TurnOutcome, Error> {
        let started = Instant::now();
        let deadline = started + self.turn_timeout;
        let mut steps = 0usize;
        let mut tool_calls_made = 0usize;

        transcript.append(Message::user_text(user_text))?;

        info!(
            model = %self.model_id,
            max_steps = self.max_steps,
            "Turn starting"
        );

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            steps += 1;
            if steps > self.max_steps {
                warn!(steps = self.max_steps, "Step budget exhausted, ending turn");
                let text = "step budget exhausted";
                transcript.append(Message::assistant_text(text))?;
                send_event(
                    events,
                    AgentStreamEvent::TextDelta { text: text.into() },
                )
                .await;
                return self
                    .finish(
                        transcript,
                        TurnStop::StepBudgetExhausted,
                        steps - 1,
                        tool_calls_made,
                        events,
                    )
                    .await;
            }

            debug!(step = steps, transcript_len = transcript.len(), "Loop step");

            let request = ModelRequest {
                model: self.model_id.clone(),
                system: self.system_prompt.clone(),
                messages: transcript.view(),
                tools: self.executor.registry().schemas(),
                max_tokens: self.max_tokens,
                temperature: self.temperature,
            };

            let response = self
                .request_with_retries(request, cancel, deadline, started, events)
                .await?;

            let assistant = Message::assistant(response.blocks.clone());
            let calls = assistant.tool_calls();
            transcript.append(assistant)?;

            // Terminal: nothing left to answer.
            if calls.is_empty() || response.stop == StopReason::EndTurn {
                return self
                    .finish(transcript, TurnStop::Complete, steps, tool_calls_made, events)
                    .await;
            }

            for call in &calls {
                send_event(
                    events,
                    AgentStreamEvent::ToolCall {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        input: call.input.clone(),
                    },
                )
                .await;
            }

            tool_calls_made += calls.len();
            state.bump_turn().await;

            // Run the batch under the remaining turn budget. On deadline the
            // batch is cancelled cooperatively and still returns a full
            // result list, so the transcript closes at a valid boundary.
            let remaining = deadline.saturating_duration_since(Instant::now());
            let deadline_hit;
            let batch_cancel = cancel.child_token();
            let results = {
                let batch = self
                    .executor
                    .run_batch(&calls, state, session_id.clone(), &batch_cancel);
                tokio::pin!(batch);
                tokio::select! {
                    results = &mut batch => {
                        deadline_hit = false;
                        results
                    }
                    _ = tokio::time::sleep(remaining) => {
                        warn!("Turn deadline hit mid-batch, cancelling tools");
                        batch_cancel.cancel();
                        deadline_hit = true;
                        batch.await
                    }
                }
            };

            for block in &results {
                if let Block::ToolResult { id, status, payload } = block {
                    send_event(
                        events,
                        AgentStreamEvent::ToolResult {
                            id: id.clone(),
                            ok: *status == deepnest_core::message::ToolResultStatus::Ok,
                            payload: payload.clone(),
                        },
                    )
                    .await;
                }
            }

            // A count or order mismatch here is a bug in the executor, not
            // something the model gets to see.
            transcript.append(Message::tool_results(results))?;

            if deadline_hit {
                return Err(Error::TurnTimeout {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
            }
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
        }
    }

    async fn finish(
        &self,
        transcript: &Transcript,
        stop: TurnStop,
        steps: usize,
        tool_calls_made: usize,
        events: Option<&mpsc::Sender<AgentStreamEvent>>,
    ) -> Result<TurnOutcome, Error> {
        let final_text = transcript.final_text().unwrap_or_default();
        info!(steps, tool_calls_made, ?stop, "Turn complete");
        send_event(
            events,
            AgentStreamEvent::Done {
                final_text: final_text.clone(),
                stop,
                steps,
                tool_calls_made,
            },
        )
        .await;
        Ok(TurnOutcome {
            final_text,
            stop,
            steps,
            tool_calls_made,
        })
    }

    /// One model request with the retry policy for transient failures.
    ///
    /// The transcript is untouched in here, so a retried request replays
    /// the exact same view. With an event sender attached the request is
    /// streamed: text deltas are forwarded as they arrive and the blocks
    /// are assembled locally; a truncated stream counts as transient.
    async fn request_with_retries(
        &self,
        request: ModelRequest,
        cancel: &CancellationToken,
        deadline: Instant,
        started: Instant,
        events: Option<&mpsc::Sender<AgentStreamEvent>>,
    ) -> Result<ModelResponse, Error> {
        let mut attempt = 0usize;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::TurnTimeout {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
            }
            let per_request = self.model_timeout.min(remaining);
            let turn_limited = per_request < self.model_timeout;

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                outcome = tokio::time::timeout(per_request, self.fetch_completion(request.clone(), events)) => outcome,
            };

            let error = match outcome {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(e)) => e,
                Err(_) if turn_limited => {
                    return Err(Error::TurnTimeout {
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    });
                }
                Err(_) => ModelError::Timeout(format!(
                    "model request exceeded {}ms",
                    per_request.as_millis()
                )),
            };

            if !error.is_transient() || attempt >= self.retries {
                return Err(error.into());
            }

            let delay = backoff_delay(attempt);
            warn!(
                attempt = attempt + 1,
                retries = self.retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient model error, retrying"
            );
            attempt += 1;

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Fetch one completion, whole or streamed.
    ///
    /// Streaming is used when a caller is listening for events: deltas go
    /// out immediately, and the block assembler rebuilds the whole
    /// response in emission order for the loop.
    async fn fetch_completion(
        &self,
        request: ModelRequest,
        events: Option<&mpsc::Sender<AgentStreamEvent>>,
    ) -> Result<ModelResponse, ModelError> {
        let Some(tx) = events else {
            return self.model.complete(request).await;
        };

        let mut rx = self.model.stream(request).await?;
        let mut assembler = BlockAssembler::new();
        while let Some(event) = rx.recv().await {
            let event = event?;
            if let StreamEvent::TextDelta { text } = &event {
                let _ = tx
                    .send(AgentStreamEvent::TextDelta { text: text.clone() })
                    .await;
            }
            assembler.push(event)?;
        }

        let (blocks, stop, usage) = assembler.finish()?;
        Ok(ModelResponse {
            blocks,
            stop,
            usage,
            model: self.model_id.clone(),
        })
    }
}

/// Exponential backoff with jitter.
fn backoff_delay(attempt: usize) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(1u32 << attempt.min(5) as u32);
    let jitter = Duration::from_millis(rand::rng().random_range(0..BACKOFF_JITTER_MS));
    exp.min(BACKOFF_CAP) + jitter
}

async fn send_event(events: Option<&mpsc::Sender<AgentStreamEvent>>, event: AgentStreamEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event).await;
    }
}
