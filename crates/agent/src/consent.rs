//! Optional pre-dispatch consent hook.
//!
//! When configured (and not bypassed), every tool call is reviewed before
//! it runs. A denial becomes an error tool-result the model can read; it
//! never aborts the batch.

use async_trait::async_trait;

/// Verdict for one tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsentDecision {
    Allow,
    Deny { reason: String },
}

/// Reviews tool calls before dispatch.
#[async_trait]
pub trait ConsentHook: Send + Sync {
    async fn review(&self, tool_name: &str, input: &serde_json::Value) -> ConsentDecision;
}

/// Allows everything; the hook equivalent of bypassing consent.
pub struct AllowAll;

#[async_trait]
impl ConsentHook for AllowAll {
    async fn review(&self, _tool_name: &str, _input: &serde_json::Value) -> ConsentDecision {
        ConsentDecision::Allow
    }
}
