//! Concurrent tool execution with order-preserving result reassembly.
//!
//! A batch is the list of tool uses from one assistant message. Handlers
//! run in parallel under bounded concurrency and finish in whatever order
//! they like; the results are collected into a map keyed by tool-use id
//! and the output list is produced by walking the *input* order. Appending
//! results as they complete is exactly the race this module exists to
//! close — the model rejects a turn whose results are permuted.
//!
//! A batch never raises. Unknown tools, schema violations, handler errors,
//! timeouts, consent denials, and cancellation all collapse into error
//! tool-results in the right slot, so a batch of `n` uses always yields
//! exactly `n` results.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use deepnest_core::message::Block;
use deepnest_core::state::StateCell;
use deepnest_core::tool::{validate_input, EffectClass, ToolCall, ToolContext, ToolRegistry};

use crate::consent::{ConsentDecision, ConsentHook};

/// Executes tool batches against one registry.
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,

    /// Per-agent concurrency bound.
    local_limit: Arc<Semaphore>,

    /// Optional process-wide bound shared with nested sub-agent executors,
    /// capping total in-flight handlers across the whole delegation tree.
    global_limit: Option<Arc<Semaphore>>,

    /// Per-handler deadline.
    tool_timeout: Duration,

    /// Optional pre-dispatch review. `None` when consent is bypassed.
    consent: Option<Arc<dyn ConsentHook>>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, max_parallel: usize, tool_timeout: Duration) -> Self {
        Self {
            registry,
            local_limit: Arc::new(Semaphore::new(max_parallel.max(1))),
            global_limit: None,
            tool_timeout,
            consent: None,
        }
    }

    /// Share a process-wide in-flight cap with other executors.
    pub fn with_global_limit(mut self, limit: Arc<Semaphore>) -> Self {
        self.global_limit = Some(limit);
        self
    }

    /// Review every call before dispatch.
    pub fn with_consent(mut self, hook: Arc<dyn ConsentHook>) -> Self {
        self.consent = Some(hook);
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Run one batch. Returns exactly `calls.len()` tool-result blocks,
    /// ordered to match `calls`.
    pub async fn run_batch(
        &self,
        calls: &[ToolCall],
        state: &StateCell,
        session_id: Option<String>,
        cancel: &CancellationToken,
    ) -> Vec<Block> {
        debug!(batch_size = calls.len(), "Dispatching tool batch");

        let tasks = calls.iter().map(|call| {
            let call = call.clone();
            let state = state.clone();
            let session_id = session_id.clone();
            let cancel = cancel.clone();
            async move {
                let result = self.execute_one(&call, state, session_id, cancel).await;
                (call.id.clone(), result)
            }
        });

        let completed = futures::future::join_all(tasks).await;

        // Completion order is arbitrary; rebuild request order via the map.
        let mut by_id: HashMap<String, Block> = completed.into_iter().collect();
        calls
            .iter()
            .map(|call| {
                by_id
                    .remove(&call.id)
                    .unwrap_or_else(|| Block::tool_error(&call.id, "cancelled"))
            })
            .collect()
    }

    async fn execute_one(
        &self,
        call: &ToolCall,
        state: StateCell,
        session_id: Option<String>,
        cancel: CancellationToken,
    ) -> Block {
        let Some(descriptor) = self.registry.get(&call.name).cloned() else {
            warn!(tool = %call.name, "Unknown tool requested");
            return Block::tool_error(&call.id, format!("unknown tool: {}", call.name));
        };

        if let Some(hook) = &self.consent
            && let ConsentDecision::Deny { reason } = hook.review(&call.name, &call.input).await
        {
            return Block::tool_error(&call.id, format!("denied: {reason}"));
        }

        // The schema gate runs before dispatch; its message goes to the model.
        if let Err(e) = validate_input(&call.name, &descriptor.input_schema, &call.input) {
            return Block::tool_error(&call.id, e.to_string());
        }

        // Child token so a per-handler timeout can signal just this handler.
        let handler_cancel = cancel.child_token();
        let ctx = ToolContext {
            state: state.clone(),
            session_id,
            cancel: handler_cancel.clone(),
        };

        let work = async {
            let _local = match self.local_limit.acquire().await {
                Ok(permit) => permit,
                Err(_) => return Block::tool_error(&call.id, "cancelled"),
            };
            // Delegating tools wait on nested work; their children take the
            // global permits instead.
            let _global = match (&self.global_limit, descriptor.delegating) {
                (Some(limit), false) => match limit.acquire().await {
                    Ok(permit) => Some(permit),
                    Err(_) => return Block::tool_error(&call.id, "cancelled"),
                },
                _ => None,
            };

            // State-effect handlers hold the single-writer lease for their
            // whole run; pure and external handlers take no lease.
            let _lease = match descriptor.effect {
                EffectClass::State => Some(state.acquire_lease().await),
                EffectClass::Pure | EffectClass::External => None,
            };

            let start = std::time::Instant::now();
            // A delegating tool is bounded by its nested turn deadline, not
            // the per-handler timeout; everything else gets T_tool.
            let handler = descriptor.invoke(call.input.clone(), ctx);
            let outcome = if descriptor.delegating {
                Ok(handler.await)
            } else {
                tokio::time::timeout(self.tool_timeout, handler).await
            };
            match outcome {
                Ok(Ok(payload)) => {
                    debug!(
                        tool = %call.name,
                        duration_ms = start.elapsed().as_millis() as u64,
                        "Tool completed"
                    );
                    Block::tool_ok(&call.id, payload)
                }
                Ok(Err(e)) => {
                    warn!(tool = %call.name, error = %e, "Tool handler failed");
                    Block::tool_error(&call.id, e.to_string())
                }
                Err(_) => {
                    warn!(
                        tool = %call.name,
                        timeout_ms = self.tool_timeout.as_millis() as u64,
                        "Tool timed out"
                    );
                    handler_cancel.cancel();
                    Block::tool_error(&call.id, "cancelled: timeout")
                }
            }
        };

        // Batch-level cancellation trumps everything; the slot still fills.
        tokio::select! {
            _ = cancel.cancelled() => {
                handler_cancel.cancel();
                Block::tool_error(&call.id, "cancelled")
            }
            block = work => block,
        }
    }
}
