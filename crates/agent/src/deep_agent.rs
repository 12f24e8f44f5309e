//! The `DeepAgent` facade: builder, blocking and streaming invocation,
//! session binding, and read access to the agent state.
//!
//! A deep agent is the lead reason-act loop wired with the built-in
//! planning and virtual-filesystem tools, any custom tools, and a `task`
//! delegation tool over the compiled sub-agent configs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use deepnest_config::RuntimeOptions;
use deepnest_core::error::Error;
use deepnest_core::model::ModelClient;
use deepnest_core::session::{SessionRecord, SessionStore};
use deepnest_core::state::{AgentState, StateCell, Todo};
use deepnest_core::tool::{ToolDescriptor, ToolRegistry};
use deepnest_core::transcript::Transcript;

use crate::consent::ConsentHook;
use crate::executor::ToolExecutor;
use crate::loop_runner::{AgentLoop, TurnStop};
use crate::stream_event::AgentStreamEvent;
use crate::subagent::{compile_subagents, task_tool, SubAgentSpec};

/// Default model id when the builder does not override it.
pub const DEFAULT_MODEL_ID: &str = "claude-sonnet-4-5";

/// Global in-flight tool cap, as a multiple of per-agent parallelism.
/// Bounds the product of outer and inner fan-out across nested agents.
const GLOBAL_PERMIT_FACTOR: usize = 4;

/// The result of one `invoke`.
#[derive(Debug, Clone)]
pub struct TurnResult {
    pub final_text: String,
    pub stop: TurnStop,
    pub steps: usize,
    pub tool_calls_made: usize,
    /// Snapshot of the agent state after the turn
    pub state: AgentState,
}

#[derive(Clone)]
struct SessionBinding {
    store: Arc<dyn SessionStore>,
    id: String,
    /// Whether the stored record has been loaded into this agent yet
    loaded: Arc<AtomicBool>,
    /// The last record seen, for carrying `created_at` forward
    previous: Arc<Mutex<Option<SessionRecord>>>,
}

enum SessionTarget {
    /// An explicit store plus session id
    Store(Arc<dyn SessionStore>, String),
    /// A session id resolved against `session_storage_dir` at build time
    StorageDir(String),
}

/// Builder for [`DeepAgent`].
pub struct DeepAgentBuilder {
    model: Arc<dyn ModelClient>,
    model_id: String,
    instructions: String,
    tools: Vec<ToolDescriptor>,
    subagents: Vec<SubAgentSpec>,
    include_default_tools: bool,
    enable_delegation: bool,
    options: RuntimeOptions,
    session: Option<SessionTarget>,
    consent: Option<Arc<dyn ConsentHook>>,
    initial_state: Option<AgentState>,
}

impl DeepAgentBuilder {
    fn new(model: Arc<dyn ModelClient>) -> Self {
        Self {
            model,
            model_id: DEFAULT_MODEL_ID.into(),
            instructions: String::new(),
            tools: Vec::new(),
            subagents: Vec::new(),
            include_default_tools: true,
            enable_delegation: true,
            options: RuntimeOptions::default(),
            session: None,
            consent: None,
            initial_state: None,
        }
    }

    pub fn model_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }

    /// The lead's system prompt.
    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn tool(mut self, tool: ToolDescriptor) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tools(mut self, tools: Vec<ToolDescriptor>) -> Self {
        self.tools.extend(tools);
        self
    }

    pub fn subagent(mut self, spec: SubAgentSpec) -> Self {
        self.subagents.push(spec);
        self
    }

    /// Skip the built-in planning and filesystem tools.
    pub fn without_default_tools(mut self) -> Self {
        self.include_default_tools = false;
        self
    }

    /// Skip sub-agent support entirely (no `task` tool).
    pub fn without_delegation(mut self) -> Self {
        self.enable_delegation = false;
        self
    }

    pub fn options(mut self, options: RuntimeOptions) -> Self {
        self.options = options;
        self
    }

    /// Persist and restore this agent under the given session id.
    pub fn session(mut self, store: Arc<dyn SessionStore>, session_id: impl Into<String>) -> Self {
        self.session = Some(SessionTarget::Store(store, session_id.into()));
        self
    }

    /// Persist under the given session id with a file store rooted at the
    /// options' `session_storage_dir`.
    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session = Some(SessionTarget::StorageDir(session_id.into()));
        self
    }

    /// Review tool calls before dispatch. Ignored when
    /// `bypass_tool_consent` is set in the options.
    pub fn consent_hook(mut self, hook: Arc<dyn ConsentHook>) -> Self {
        self.consent = Some(hook);
        self
    }

    /// Seed the agent state (todos, files, scratch).
    pub fn initial_state(mut self, state: AgentState) -> Self {
        self.initial_state = Some(state);
        self
    }

    pub fn build(self) -> Result<DeepAgent, Error> {
        self.options
            .validate()
            .map_err(|message| Error::Config { message })?;

        let mut registry = ToolRegistry::new();
        if self.include_default_tools {
            for tool in deepnest_tools::default_tools() {
                registry.register(tool);
            }
        }
        for tool in self.tools {
            registry.register(tool);
        }

        let global_limit = Arc::new(Semaphore::new(
            self.options.max_parallel_tools * GLOBAL_PERMIT_FACTOR,
        ));

        if self.enable_delegation {
            let configs = compile_subagents(
                self.subagents,
                &registry,
                &self.model,
                &self.model_id,
                &self.instructions,
            )?;
            registry.register(task_tool(
                Arc::new(configs),
                self.options.clone(),
                Arc::clone(&global_limit),
            ));
        }

        let mut executor = ToolExecutor::new(
            Arc::new(registry),
            self.options.max_parallel_tools,
            self.options.tool_timeout(),
        )
        .with_global_limit(global_limit);

        if !self.options.bypass_tool_consent
            && let Some(hook) = self.consent
        {
            executor = executor.with_consent(hook);
        }

        let agent_loop = AgentLoop::new(
            self.model,
            self.model_id,
            self.instructions,
            executor,
        )
        .with_max_steps(self.options.max_steps_per_turn)
        .with_retries(self.options.model_request_retries)
        .with_model_timeout(self.options.model_request_timeout())
        .with_turn_timeout(self.options.turn_timeout());

        let session = self.session.map(|target| {
            let (store, id): (Arc<dyn SessionStore>, String) = match target {
                SessionTarget::Store(store, id) => (store, id),
                SessionTarget::StorageDir(id) => (
                    Arc::new(deepnest_session::FileSessionStore::new(
                        self.options.session_storage_dir.clone(),
                    )),
                    id,
                ),
            };
            SessionBinding {
                store,
                id,
                loaded: Arc::new(AtomicBool::new(false)),
                previous: Arc::new(Mutex::new(None)),
            }
        });

        info!(
            session = session.as_ref().map(|b| b.id.as_str()),
            "Deep agent built"
        );

        Ok(DeepAgent {
            agent_loop: Arc::new(agent_loop),
            state: StateCell::new(self.initial_state.unwrap_or_default()),
            transcript: Arc::new(Mutex::new(Transcript::new())),
            session,
            cancel: CancellationToken::new(),
        })
    }
}

/// A lead agent with planning, a virtual filesystem, and delegation.
#[derive(Clone)]
pub struct DeepAgent {
    agent_loop: Arc<AgentLoop>,
    state: StateCell,
    transcript: Arc<Mutex<Transcript>>,
    session: Option<SessionBinding>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for DeepAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeepAgent").finish_non_exhaustive()
    }
}

impl DeepAgent {
    pub fn builder(model: Arc<dyn ModelClient>) -> DeepAgentBuilder {
        DeepAgentBuilder::new(model)
    }

    /// Run one turn to completion and return the final text plus a state
    /// snapshot. Turns on the same agent are serialized.
    pub async fn invoke(&self, user_text: &str) -> Result<TurnResult, Error> {
        self.run_invoke(user_text, None).await
    }

    /// Run one turn, streaming progress events. The turn runs in a
    /// background task; the receiver yields events until `Done` or `Error`.
    pub fn invoke_stream(&self, user_text: &str) -> mpsc::Receiver<AgentStreamEvent> {
        let (tx, rx) = mpsc::channel(128);
        let agent = self.clone();
        let user_text = user_text.to_string();
        tokio::spawn(async move {
            if let Err(e) = agent.run_invoke(&user_text, Some(&tx)).await {
                let _ = tx
                    .send(AgentStreamEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
            }
        });
        rx
    }

    async fn run_invoke(
        &self,
        user_text: &str,
        events: Option<&mpsc::Sender<AgentStreamEvent>>,
    ) -> Result<TurnResult, Error> {
        // Claim the session id for the whole turn; a concurrent opener of
        // the same session fails fast with SessionBusy.
        let _lease = match &self.session {
            Some(binding) => Some(binding.store.acquire(&binding.id)?),
            None => None,
        };

        let mut transcript = self.transcript.lock().await;
        self.restore_session(&mut transcript).await?;

        let session_id = self.session.as_ref().map(|b| b.id.clone());
        let outcome = self
            .agent_loop
            .run_turn(
                &mut transcript,
                &self.state,
                user_text,
                session_id,
                &self.cancel,
                events,
            )
            .await?;

        self.persist_session(&transcript).await?;

        Ok(TurnResult {
            final_text: outcome.final_text,
            stop: outcome.stop,
            steps: outcome.steps,
            tool_calls_made: outcome.tool_calls_made,
            state: self.state.snapshot().await,
        })
    }

    /// Load the stored record into the transcript and state, once.
    async fn restore_session(&self, transcript: &mut Transcript) -> Result<(), Error> {
        let Some(binding) = &self.session else {
            return Ok(());
        };
        if binding.loaded.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let Some(record) = binding.store.load(&binding.id).await? else {
            debug!(session_id = %binding.id, "No stored session, starting fresh");
            return Ok(());
        };

        *transcript = Transcript::from_messages(record.messages.clone())?;
        self.state.restore(record.state.clone()).await;
        *binding.previous.lock().await = Some(record);
        info!(session_id = %binding.id, "Session restored");
        Ok(())
    }

    async fn persist_session(&self, transcript: &Transcript) -> Result<(), Error> {
        let Some(binding) = &self.session else {
            return Ok(());
        };
        let mut record = SessionRecord::new(
            binding.id.clone(),
            transcript.view(),
            self.state.snapshot().await,
        );
        let mut previous = binding.previous.lock().await;
        if let Some(prev) = previous.as_ref() {
            record = record.touched_from(prev);
        }
        binding.store.save(&record).await?;
        *previous = Some(record);
        Ok(())
    }

    /// Handle for typed reads of the agent state.
    pub fn state(&self) -> &StateCell {
        &self.state
    }

    pub async fn list_todos(&self) -> Vec<Todo> {
        self.state.todos().await
    }

    pub async fn list_files(&self) -> Vec<String> {
        self.state.list_files(None).await
    }

    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.state.scratch_get(key).await
    }

    /// Snapshot of the transcript so far.
    pub async fn transcript(&self) -> Vec<deepnest_core::message::Message> {
        self.transcript.lock().await.view()
    }

    /// Token for cooperative abort of the running turn.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::*;
    use deepnest_session::InMemorySessionStore;

    fn scripted(responses: Vec<deepnest_core::model::ModelResponse>) -> Arc<dyn ModelClient> {
        Arc::new(ScriptedModel::new(responses))
    }

    #[tokio::test]
    async fn invoke_returns_final_text_and_state() {
        let agent = DeepAgent::builder(scripted(vec![text_response("All done.")]))
            .instructions("You are helpful.")
            .build()
            .unwrap();

        let result = agent.invoke("Hi").await.unwrap();
        assert_eq!(result.final_text, "All done.");
        assert_eq!(result.stop, TurnStop::Complete);
        assert!(result.state.todos.is_empty());
    }

    #[tokio::test]
    async fn default_tools_and_task_are_registered() {
        let model = scripted(vec![tool_use_response(
            vec![tool_use(
                "tu_1",
                "write_todos",
                serde_json::json!({"todos": [
                    {"id": "1", "content": "Plan", "status": "pending"}
                ]}),
            )],
            "planning",
        ), text_response("Planned.")]);

        let agent = DeepAgent::builder(model)
            .instructions("Plan things.")
            .build()
            .unwrap();

        let result = agent.invoke("Make a plan").await.unwrap();
        assert_eq!(result.final_text, "Planned.");
        assert_eq!(agent.list_todos().await.len(), 1);
    }

    #[tokio::test]
    async fn session_roundtrip_across_agents() {
        let store = Arc::new(InMemorySessionStore::new());

        let first = DeepAgent::builder(scripted(vec![tool_use_response(
            vec![tool_use(
                "tu_1",
                "write_file",
                serde_json::json!({"path": "notes.md", "content": "remember me"}),
            )],
            "writing",
        ), text_response("Noted.")]))
        .session(store.clone(), "user-42")
        .build()
        .unwrap();

        first.invoke("Write a note").await.unwrap();
        assert_eq!(first.list_files().await, vec!["notes.md"]);

        // A new agent under the same session id sees the prior turn.
        let second = DeepAgent::builder(scripted(vec![text_response("Welcome back.")]))
            .session(store, "user-42")
            .build()
            .unwrap();

        let result = second.invoke("Am I known here?").await.unwrap();
        assert_eq!(result.final_text, "Welcome back.");
        assert_eq!(second.list_files().await, vec!["notes.md"]);
        // Prior turn (4 messages, including the tool exchange) + this
        // turn (2 messages).
        assert_eq!(second.transcript().await.len(), 6);
    }

    #[tokio::test]
    async fn session_id_resolves_against_storage_dir() {
        let dir = tempfile::tempdir().unwrap();
        let options = RuntimeOptions {
            session_storage_dir: dir.path().to_path_buf(),
            ..RuntimeOptions::default()
        };

        let agent = DeepAgent::builder(scripted(vec![text_response("saved")]))
            .options(options)
            .session_id("dir-backed")
            .build()
            .unwrap();

        agent.invoke("hello").await.unwrap();
        assert!(dir.path().join("dir-backed.json").exists());
    }

    #[tokio::test]
    async fn initial_state_is_seeded() {
        let mut state = AgentState::default();
        state
            .scratch
            .insert("topic".into(), serde_json::json!("deep agents"));

        let agent = DeepAgent::builder(scripted(vec![text_response("ok")]))
            .initial_state(state)
            .build()
            .unwrap();

        assert_eq!(
            agent.get("topic").await,
            Some(serde_json::json!("deep agents"))
        );
    }

    #[tokio::test]
    async fn invalid_options_rejected_at_build() {
        let options = RuntimeOptions {
            max_parallel_tools: 0,
            ..RuntimeOptions::default()
        };
        let err = DeepAgent::builder(scripted(vec![]))
            .options(options)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[tokio::test]
    async fn invoke_stream_yields_done() {
        let agent = DeepAgent::builder(scripted(vec![text_response("streamed")]))
            .build()
            .unwrap();

        let mut rx = agent.invoke_stream("go");
        let mut saw_done = false;
        while let Some(event) = rx.recv().await {
            if let AgentStreamEvent::Done { final_text, .. } = event {
                assert_eq!(final_text, "streamed");
                saw_done = true;
            }
        }
        assert!(saw_done);
    }
}
