//! # Deepnest Agent
//!
//! The orchestration core: a reason-act loop against a tool-using model,
//! a concurrent tool executor with order-preserving result reassembly,
//! and sub-agent delegation through the `task` tool.
//!
//! The public entry point is [`DeepAgent`]:
//!
//! ```ignore
//! let agent = DeepAgent::builder(model)
//!     .instructions("You are a research lead.")
//!     .subagent(SubAgentSpec::new(
//!         "research_subagent",
//!         "Searches and summarizes sources",
//!         "You are a focused researcher.",
//!     ))
//!     .build()?;
//!
//! let result = agent.invoke("Compare the two proposals").await?;
//! println!("{}", result.final_text);
//! ```

pub mod consent;
pub mod deep_agent;
pub mod executor;
pub mod loop_runner;
pub mod stream_event;
pub mod subagent;
pub mod test_helpers;

pub use consent::{AllowAll, ConsentDecision, ConsentHook};
pub use deep_agent::{DeepAgent, DeepAgentBuilder, TurnResult, DEFAULT_MODEL_ID};
pub use executor::ToolExecutor;
pub use loop_runner::{AgentLoop, TurnOutcome, TurnStop};
pub use stream_event::AgentStreamEvent;
pub use subagent::{compile_subagents, task_tool, SubAgentConfig, SubAgentSpec, GENERAL_PURPOSE, TASK_TOOL_NAME};
