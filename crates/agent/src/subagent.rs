//! Sub-agent compilation and the `task` delegation tool.
//!
//! Sub-agents are compiled to immutable configs at construction — a config
//! carries a system prompt, a tool registry, and a model handle, and
//! deliberately has no transcript field. Every `task` invocation builds a
//! brand-new agent from the config: fresh transcript, fresh state, one
//! seeded user message. Nothing survives the call, so repeated or parallel
//! delegations to the same type can never see each other's turns.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use deepnest_config::RuntimeOptions;
use deepnest_core::error::{Error, ToolError};
use deepnest_core::model::ModelClient;
use deepnest_core::state::{AgentState, StateCell};
use deepnest_core::tool::{
    EffectClass, ToolContext, ToolDescriptor, ToolHandler, ToolRegistry,
};
use deepnest_core::transcript::Transcript;

use crate::executor::ToolExecutor;
use crate::loop_runner::AgentLoop;

/// Name of the delegation tool registered on the lead.
pub const TASK_TOOL_NAME: &str = "task";

/// Name of the always-available sub-agent that mirrors the lead.
pub const GENERAL_PURPOSE: &str = "general_purpose";

/// User-facing sub-agent specification, input to the agent builder.
pub struct SubAgentSpec {
    /// Unique name; becomes the `subagent_type` argument of `task`
    pub name: String,

    /// Surfaced to the lead in the `task` tool documentation
    pub description: String,

    /// The sub-agent's system prompt
    pub prompt: String,

    /// Tools for this sub-agent. `None` inherits the lead's tools minus
    /// the delegation tool itself.
    pub tools: Option<Vec<ToolDescriptor>>,

    /// Model override; `None` uses the lead's model.
    pub model: Option<Arc<dyn ModelClient>>,

    /// Model id override; `None` uses the lead's model id.
    pub model_id: Option<String>,

    /// Share the parent's virtual files with this sub-agent: the child
    /// starts from a snapshot of the parent's files and its writes are
    /// merged back on return.
    pub share_files: bool,
}

impl SubAgentSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            prompt: prompt.into(),
            tools: None,
            model: None,
            model_id: None,
            share_files: false,
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDescriptor>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_model(mut self, model: Arc<dyn ModelClient>, model_id: impl Into<String>) -> Self {
        self.model = Some(model);
        self.model_id = Some(model_id.into());
        self
    }

    pub fn with_shared_files(mut self) -> Self {
        self.share_files = true;
        self
    }
}

/// The compiled, immutable form of a sub-agent.
///
/// Shared read-only across every `task` call; holds no mutable state and
/// no transcript, so a cached config can never leak turns between calls.
pub struct SubAgentConfig {
    pub name: String,
    pub description: String,
    system_prompt: String,
    tools: Arc<ToolRegistry>,
    model: Arc<dyn ModelClient>,
    model_id: String,
    share_files: bool,
}

impl std::fmt::Debug for SubAgentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubAgentConfig")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("model_id", &self.model_id)
            .field("share_files", &self.share_files)
            .finish_non_exhaustive()
    }
}

/// Compile sub-agent specs into configs keyed by name.
///
/// A `general_purpose` sub-agent mirroring the lead is always included;
/// a user spec with that name replaces it. Inherited registries are the
/// lead's tools minus the delegation tool, so a sub-agent cannot recurse
/// unless it is explicitly handed `task`.
pub fn compile_subagents(
    specs: Vec<SubAgentSpec>,
    lead_tools: &ToolRegistry,
    lead_model: &Arc<dyn ModelClient>,
    lead_model_id: &str,
    lead_instructions: &str,
) -> Result<HashMap<String, Arc<SubAgentConfig>>, Error> {
    let inherited: Vec<ToolDescriptor> = lead_tools
        .descriptors()
        .into_iter()
        .filter(|d| d.name != TASK_TOOL_NAME)
        .collect();
    let inherited_registry = Arc::new(ToolRegistry::from_descriptors(inherited.clone()));

    let mut configs: HashMap<String, Arc<SubAgentConfig>> = HashMap::new();
    configs.insert(
        GENERAL_PURPOSE.to_string(),
        Arc::new(SubAgentConfig {
            name: GENERAL_PURPOSE.into(),
            description: "A general agent with the lead's own instructions and tools. \
                          Useful for context quarantine: offload a self-contained \
                          task without growing the lead's transcript."
                .into(),
            system_prompt: lead_instructions.to_string(),
            tools: Arc::clone(&inherited_registry),
            model: Arc::clone(lead_model),
            model_id: lead_model_id.to_string(),
            share_files: false,
        }),
    );

    for spec in specs {
        if spec.name != GENERAL_PURPOSE && configs.contains_key(&spec.name) {
            return Err(Error::Config {
                message: format!("duplicate sub-agent name: {}", spec.name),
            });
        }
        let tools = match spec.tools {
            Some(descriptors) => Arc::new(ToolRegistry::from_descriptors(descriptors)),
            None => Arc::clone(&inherited_registry),
        };
        let config = SubAgentConfig {
            name: spec.name.clone(),
            description: spec.description,
            system_prompt: spec.prompt,
            tools,
            model: spec.model.unwrap_or_else(|| Arc::clone(lead_model)),
            model_id: spec.model_id.unwrap_or_else(|| lead_model_id.to_string()),
            share_files: spec.share_files,
        };
        configs.insert(spec.name, Arc::new(config));
    }

    debug!(count = configs.len(), "Sub-agent configs compiled");
    Ok(configs)
}

#[derive(Deserialize)]
struct TaskInput {
    description: String,
    subagent_type: String,
}

/// The handler behind the `task` tool.
struct TaskTool {
    configs: Arc<HashMap<String, Arc<SubAgentConfig>>>,
    options: RuntimeOptions,
    global_limit: Arc<Semaphore>,
}

#[async_trait]
impl ToolHandler for TaskTool {
    async fn call(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let input: TaskInput =
            serde_json::from_value(input).map_err(|e| ToolError::InvalidInput {
                tool_name: TASK_TOOL_NAME.into(),
                reason: e.to_string(),
            })?;

        let Some(config) = self.configs.get(&input.subagent_type) else {
            let mut available: Vec<&str> =
                self.configs.keys().map(String::as_str).collect();
            available.sort_unstable();
            return Err(ToolError::HandlerFailed {
                tool_name: TASK_TOOL_NAME.into(),
                reason: format!(
                    "unknown subagent_type '{}' (available: {})",
                    input.subagent_type,
                    available.join(", ")
                ),
            });
        };

        info!(subagent = %config.name, "Delegating to sub-agent");

        // A brand-new agent per call: fresh transcript, fresh state. The
        // config contributes only immutable pieces.
        let state = StateCell::new(AgentState::default());
        if config.share_files {
            state.merge_files(ctx.state.files_snapshot().await).await;
        }

        let executor = ToolExecutor::new(
            Arc::clone(&config.tools),
            self.options.max_parallel_tools,
            self.options.tool_timeout(),
        )
        .with_global_limit(Arc::clone(&self.global_limit));

        let nested = AgentLoop::new(
            Arc::clone(&config.model),
            config.model_id.clone(),
            config.system_prompt.clone(),
            executor,
        )
        .with_max_steps(self.options.max_steps_per_turn)
        .with_retries(self.options.model_request_retries)
        .with_model_timeout(self.options.model_request_timeout())
        .with_turn_timeout(self.options.turn_timeout());

        let mut transcript = Transcript::new();
        let outcome = nested
            .run_turn(
                &mut transcript,
                &state,
                &input.description,
                ctx.session_id.clone(),
                &ctx.cancel,
                None,
            )
            .await
            .map_err(|e| ToolError::HandlerFailed {
                tool_name: TASK_TOOL_NAME.into(),
                reason: format!("sub-agent '{}' failed: {e}", config.name),
            })?;

        if config.share_files {
            ctx.state.merge_files(state.files_snapshot().await).await;
        }

        info!(
            subagent = %config.name,
            steps = outcome.steps,
            "Sub-agent returned"
        );

        // The nested transcript and state drop here; nothing is retained.
        Ok(serde_json::Value::String(outcome.final_text))
    }
}

/// Build the `task` tool descriptor over a compiled config map.
pub fn task_tool(
    configs: Arc<HashMap<String, Arc<SubAgentConfig>>>,
    options: RuntimeOptions,
    global_limit: Arc<Semaphore>,
) -> ToolDescriptor {
    let mut lines: Vec<String> = configs
        .values()
        .map(|c| format!("- {}: {}", c.name, c.description))
        .collect();
    lines.sort();
    let description = format!(
        "Delegate a self-contained task to a specialist sub-agent. The \
         sub-agent starts from a clean slate, works the task to completion \
         with its own tools, and returns its final answer as this tool's \
         result. Available sub-agents:\n{}",
        lines.join("\n")
    );

    ToolDescriptor::new(
        TASK_TOOL_NAME,
        description,
        serde_json::json!({
            "type": "object",
            "properties": {
                "description": {
                    "type": "string",
                    "description": "Complete, standalone instructions for the sub-agent"
                },
                "subagent_type": {
                    "type": "string",
                    "description": "Which sub-agent to run"
                }
            },
            "required": ["description", "subagent_type"]
        }),
        EffectClass::External,
        TaskTool {
            configs,
            options,
            global_limit,
        },
    )
    .delegating()
}
