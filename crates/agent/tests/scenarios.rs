//! End-to-end scenarios for the deep-agent runtime: parallel fan-out
//! reordering, sub-agent isolation, todo lifecycle, step budgets, retry
//! behavior, cancellation, and session persistence.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use deepnest_agent::test_helpers::*;
use deepnest_agent::{DeepAgent, SubAgentSpec, ToolExecutor, TurnStop};
use deepnest_config::RuntimeOptions;
use deepnest_core::error::{Error, ModelError, ToolError};
use deepnest_core::message::{Block, Message, Role, ToolResultStatus};
use deepnest_core::model::{ModelClient, ModelRequest, ModelResponse};
use deepnest_core::state::{AgentState, StateCell, TodoStatus};
use deepnest_core::tool::{EffectClass, ToolCall, ToolContext, ToolDescriptor, ToolHandler, ToolRegistry};
use deepnest_session::FileSessionStore;

/// Sleeps for `delay_ms`, then returns a payload tagged with the given id.
struct SleepTag;

#[async_trait]
impl ToolHandler for SleepTag {
    async fn call(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let delay = input["delay_ms"].as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        Ok(serde_json::json!({"from": input["tag"]}))
    }
}

fn sleep_tag_tool() -> ToolDescriptor {
    ToolDescriptor::new(
        "sleep_tag",
        "Sleeps then answers with its tag",
        serde_json::json!({
            "type": "object",
            "properties": {
                "delay_ms": { "type": "integer" },
                "tag": { "type": "string" }
            },
            "required": ["tag"]
        }),
        EffectClass::Pure,
        SleepTag,
    )
}

/// A model client that records every request it serves.
struct RecordingModel {
    inner: ScriptedModel,
    requests: Mutex<Vec<ModelRequest>>,
}

impl RecordingModel {
    fn new(inner: ScriptedModel) -> Self {
        Self {
            inner,
            requests: Mutex::new(Vec::new()),
        }
    }

    fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelClient for RecordingModel {
    fn name(&self) -> &str {
        "recording"
    }

    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        self.requests.lock().unwrap().push(request.clone());
        self.inner.complete(request).await
    }
}

fn result_ids(message: &Message) -> Vec<&str> {
    message
        .content
        .iter()
        .filter_map(|b| match b {
            Block::ToolResult { id, .. } => Some(id.as_str()),
            _ => None,
        })
        .collect()
}

// --- E1: parallel fan-out reorder ---

#[tokio::test]
async fn parallel_fanout_results_keep_request_order() {
    let uses: Vec<Block> = [("a", 30u64), ("b", 10), ("c", 20), ("d", 5)]
        .iter()
        .map(|(id, delay)| {
            tool_use(
                id,
                "sleep_tag",
                serde_json::json!({"delay_ms": delay, "tag": id}),
            )
        })
        .collect();

    let model = Arc::new(ScriptedModel::new(vec![
        tool_use_response(uses, "fanning out"),
        text_response("all four returned"),
    ]));

    let agent = DeepAgent::builder(model)
        .instructions("Fan out.")
        .tool(sleep_tag_tool())
        .build()
        .unwrap();

    let result = agent.invoke("run them all").await.unwrap();
    assert_eq!(result.final_text, "all four returned");
    assert_eq!(result.tool_calls_made, 4);

    let transcript = agent.transcript().await;
    // user, assistant(uses), user(results), assistant(final).
    assert_eq!(transcript.len(), 4);

    let results_message = &transcript[2];
    assert_eq!(result_ids(results_message), vec!["a", "b", "c", "d"]);

    // Each payload stayed attached to the id that produced it.
    for block in &results_message.content {
        if let Block::ToolResult { id, payload, status } = block {
            assert_eq!(*status, ToolResultStatus::Ok);
            assert_eq!(payload, &serde_json::json!({"from": id}));
        }
    }
}

// --- Order preservation under random completion order ---

#[tokio::test]
async fn order_preserved_for_random_delays() {
    use rand::Rng;

    let mut registry = ToolRegistry::new();
    registry.register(sleep_tag_tool());
    let executor = ToolExecutor::new(Arc::new(registry), 8, Duration::from_secs(5));
    let state = StateCell::new(AgentState::default());

    for _round in 0..5 {
        let calls: Vec<ToolCall> = (0..8)
            .map(|i| {
                let delay: u64 = rand::rng().random_range(0..40);
                ToolCall {
                    id: format!("call_{i}"),
                    name: "sleep_tag".into(),
                    input: serde_json::json!({"delay_ms": delay, "tag": format!("call_{i}")}),
                }
            })
            .collect();

        let results = executor
            .run_batch(&calls, &state, None, &CancellationToken::new())
            .await;

        let got: Vec<String> = results
            .iter()
            .map(|b| match b {
                Block::ToolResult { id, .. } => id.clone(),
                other => panic!("expected tool result, got {other:?}"),
            })
            .collect();
        let expected: Vec<String> = calls.iter().map(|c| c.id.clone()).collect();
        assert_eq!(got, expected);
    }
}

// --- E2: sub-agent repeat invocation isolation ---

#[tokio::test]
async fn repeated_delegations_start_clean() {
    let sub_model = Arc::new(RecordingModel::new(ScriptedModel::new(vec![
        text_response("found X things"),
        text_response("found Y things"),
    ])));

    let lead_model = Arc::new(ScriptedModel::new(vec![
        tool_use_response(
            vec![tool_use(
                "tu_1",
                "task",
                serde_json::json!({"description": "research X", "subagent_type": "research_subagent"}),
            )],
            "delegating X",
        ),
        tool_use_response(
            vec![tool_use(
                "tu_2",
                "task",
                serde_json::json!({"description": "research Y", "subagent_type": "research_subagent"}),
            )],
            "delegating Y",
        ),
        text_response("both done"),
    ]));

    let agent = DeepAgent::builder(lead_model)
        .instructions("Lead.")
        .subagent(
            SubAgentSpec::new("research_subagent", "Researches", "You research.")
                .with_model(sub_model.clone(), "sub-model"),
        )
        .build()
        .unwrap();

    let result = agent.invoke("research X then Y").await.unwrap();
    assert_eq!(result.final_text, "both done");

    let requests = sub_model.requests();
    assert_eq!(requests.len(), 2);

    // Each nested transcript starts with exactly one user message carrying
    // only the delegation description — no trace of the sibling run.
    for (request, expected) in requests.iter().zip(["research X", "research Y"]) {
        assert_eq!(request.messages.len(), 1);
        assert_eq!(request.messages[0].role, Role::User);
        assert_eq!(request.messages[0].text(), expected);
    }
}

// --- E3: parallel same-subagent fan-out ---

#[tokio::test]
async fn parallel_delegations_are_independent() {
    let sub_model = Arc::new(RecordingModel::new(ScriptedModel::new(vec![
        text_response("first answer"),
        text_response("second answer"),
    ])));

    let lead_model = Arc::new(ScriptedModel::new(vec![
        tool_use_response(
            vec![
                tool_use(
                    "tu_a",
                    "task",
                    serde_json::json!({"description": "compare A", "subagent_type": "research_subagent"}),
                ),
                tool_use(
                    "tu_b",
                    "task",
                    serde_json::json!({"description": "compare B", "subagent_type": "research_subagent"}),
                ),
            ],
            "fanning out to two researchers",
        ),
        text_response("merged"),
    ]));

    let agent = DeepAgent::builder(lead_model)
        .instructions("Lead.")
        .subagent(
            SubAgentSpec::new("research_subagent", "Researches", "You research.")
                .with_model(sub_model.clone(), "sub-model"),
        )
        .build()
        .unwrap();

    let result = agent.invoke("compare A and B").await.unwrap();
    assert_eq!(result.final_text, "merged");

    // Outer results arrive in request order regardless of which nested
    // agent finished first.
    let transcript = agent.transcript().await;
    assert_eq!(result_ids(&transcript[2]), vec!["tu_a", "tu_b"]);

    // Both nested transcripts were single seeded user messages, and they
    // never shared message ids.
    let requests = sub_model.requests();
    assert_eq!(requests.len(), 2);
    for request in &requests {
        assert_eq!(request.messages.len(), 1);
    }
    let seen: Vec<String> = requests.iter().map(|r| r.messages[0].text()).collect();
    assert!(seen.contains(&"compare A".to_string()));
    assert!(seen.contains(&"compare B".to_string()));
    assert_ne!(requests[0].messages[0].id, requests[1].messages[0].id);
}

// --- E4: todo lifecycle through the loop ---

#[tokio::test]
async fn todo_single_in_progress_enforced_end_to_end() {
    let model = Arc::new(ScriptedModel::new(vec![
        tool_use_response(
            vec![tool_use(
                "tu_1",
                "write_todos",
                serde_json::json!({"todos": [
                    {"id": "1", "content": "A", "status": "pending"},
                    {"id": "2", "content": "B", "status": "pending"}
                ]}),
            )],
            "planning",
        ),
        tool_use_response(
            vec![tool_use(
                "tu_2",
                "update_todo_status",
                serde_json::json!({"id": "1", "status": "in_progress"}),
            )],
            "starting A",
        ),
        tool_use_response(
            vec![tool_use(
                "tu_3",
                "update_todo_status",
                serde_json::json!({"id": "2", "status": "in_progress"}),
            )],
            "starting B too",
        ),
        text_response("understood, one at a time"),
    ]));

    let agent = DeepAgent::builder(model).build().unwrap();
    agent.invoke("work through the plan").await.unwrap();

    // The third call came back as an error result...
    let transcript = agent.transcript().await;
    let third_results = &transcript[6];
    match &third_results.content[0] {
        Block::ToolResult { status, payload, .. } => {
            assert_eq!(*status, ToolResultStatus::Error);
            assert!(payload.as_str().unwrap().contains("already in progress"));
        }
        other => panic!("expected tool result, got {other:?}"),
    }

    // ...and the state still shows 1 in progress, 2 pending.
    let todos = agent.list_todos().await;
    assert_eq!(todos[0].status, TodoStatus::InProgress);
    assert_eq!(todos[1].status, TodoStatus::Pending);
}

// --- E5: step budget exhaustion ---

#[tokio::test]
async fn step_budget_exhaustion_flagged_and_well_formed() {
    let responses: Vec<ModelResponse> = (0..10)
        .map(|i| {
            tool_use_response(
                vec![tool_use(
                    &format!("tu_{i}"),
                    "sleep_tag",
                    serde_json::json!({"tag": "again"}),
                )],
                "one more",
            )
        })
        .collect();

    let options = RuntimeOptions {
        max_steps_per_turn: 3,
        ..RuntimeOptions::default()
    };

    let agent = DeepAgent::builder(Arc::new(ScriptedModel::new(responses)))
        .tool(sleep_tag_tool())
        .options(options)
        .build()
        .unwrap();

    let result = agent.invoke("never stop").await.unwrap();
    assert_eq!(result.stop, TurnStop::StepBudgetExhausted);
    assert!(!result.final_text.is_empty());

    // The transcript ends on the synthetic assistant message, preceded by
    // a complete tool-result message — never mid-batch.
    let transcript = agent.transcript().await;
    let last = transcript.last().unwrap();
    assert_eq!(last.role, Role::Assistant);
    assert!(transcript[transcript.len() - 2].is_tool_result_message());
}

// --- E6: transient model errors leave no trace ---

#[tokio::test]
async fn transient_failures_are_invisible_in_the_transcript() {
    let model = Arc::new(FlakyModel::new(
        2,
        ScriptedModel::single_text("third time lucky"),
    ));

    let agent = DeepAgent::builder(model).build().unwrap();
    let result = agent.invoke("hello?").await.unwrap();

    assert_eq!(result.final_text, "third time lucky");
    let transcript = agent.transcript().await;
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[0].role, Role::User);
    assert_eq!(transcript[1].role, Role::Assistant);
}

// --- Cancellation safety ---

#[tokio::test]
async fn cancellation_mid_batch_closes_the_turn_cleanly() {
    let model = Arc::new(ScriptedModel::new(vec![tool_use_response(
        vec![
            tool_use("a", "sleep_tag", serde_json::json!({"delay_ms": 5000, "tag": "a"})),
            tool_use("b", "sleep_tag", serde_json::json!({"delay_ms": 5000, "tag": "b"})),
        ],
        "long batch",
    )]));

    let agent = DeepAgent::builder(model)
        .tool(sleep_tag_tool())
        .build()
        .unwrap();

    let cancel = agent.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
    });

    let err = agent.invoke("kick off the slow batch").await.unwrap_err();
    assert!(matches!(err, Error::Cancelled));

    // Post-tool-result boundary: the batch's slots were all filled with
    // cancellation errors and appended before the turn ended.
    let transcript = agent.transcript().await;
    assert_eq!(transcript.len(), 3);
    assert!(transcript[2].is_tool_result_message());
    assert_eq!(result_ids(&transcript[2]), vec!["a", "b"]);
}

// --- Session round-trip on disk ---

#[tokio::test]
async fn file_session_survives_agent_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileSessionStore::new(dir.path()));

    let first = DeepAgent::builder(Arc::new(ScriptedModel::new(vec![
        tool_use_response(
            vec![tool_use(
                "tu_1",
                "write_todos",
                serde_json::json!({"todos": [
                    {"id": "1", "content": "Finish the report", "status": "pending"}
                ]}),
            )],
            "noting",
        ),
        text_response("Noted."),
    ])))
    .session(store.clone(), "persistent-session")
    .build()
    .unwrap();

    first.invoke("remember this task").await.unwrap();
    drop(first);

    let second = DeepAgent::builder(Arc::new(ScriptedModel::single_text("Still here.")))
        .session(store, "persistent-session")
        .build()
        .unwrap();

    second.invoke("what was I doing?").await.unwrap();
    let todos = second.list_todos().await;
    assert_eq!(todos.len(), 1);
    assert_eq!(todos[0].content, "Finish the report");
}

// --- Concurrent session access fails fast ---

#[tokio::test]
async fn second_opener_of_a_session_gets_busy() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileSessionStore::new(dir.path()));

    // A slow model keeps the first invoke (and its lease) alive.
    struct SlowModel;

    #[async_trait]
    impl ModelClient for SlowModel {
        fn name(&self) -> &str {
            "slow"
        }
        async fn complete(&self, _r: ModelRequest) -> Result<ModelResponse, ModelError> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(text_response("eventually"))
        }
    }

    let first = DeepAgent::builder(Arc::new(SlowModel))
        .session(store.clone(), "contended")
        .build()
        .unwrap();
    let second = DeepAgent::builder(Arc::new(ScriptedModel::single_text("nope")))
        .session(store, "contended")
        .build()
        .unwrap();

    let first_task = tokio::spawn(async move { first.invoke("hold the lease").await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = second.invoke("try to sneak in").await.unwrap_err();
    assert!(matches!(err, Error::Session(_)));

    first_task.await.unwrap().unwrap();
}
