use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::StreamExt;
use pretty_assertions::assert_eq;
use serde_json::json;

use super::*;
use crate::approval::PolicyGate;
use crate::error::ProviderError;
use crate::llm::{ContentPart, ModelCompletion, ModelRequest, ModelToolCall, Role};
use crate::middleware::{RunContext, RunNext, ToolInvocationContext, ToolNext};
use crate::tools::bank::{Ledger, bank_tools};
use crate::tools::{ToolExecution, ToolOutput, ToolSpec};

/// Replays canned completions and records what the engine sent.
#[derive(Default)]
struct ScriptedModel {
    responses: Mutex<VecDeque<Result<ModelCompletion, ProviderError>>>,
    requests: Mutex<Vec<(Vec<ModelMessage>, Option<String>)>>,
    released: Mutex<Vec<String>>,
}

impl ScriptedModel {
    fn with_responses(responses: Vec<Result<ModelCompletion, ProviderError>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(VecDeque::from(responses)),
            ..Self::default()
        })
    }

    fn calls(&self) -> usize {
        self.requests.lock().expect("lock poisoned").len()
    }

    fn last_messages(&self) -> Vec<ModelMessage> {
        self.requests
            .lock()
            .expect("lock poisoned")
            .last()
            .map(|(messages, _)| messages.clone())
            .unwrap_or_default()
    }

    fn continuations(&self) -> Vec<Option<String>> {
        self.requests
            .lock()
            .expect("lock poisoned")
            .iter()
            .map(|(_, continuation)| continuation.clone())
            .collect()
    }

    fn released(&self) -> Vec<String> {
        self.released.lock().expect("lock poisoned").clone()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn invoke(&self, request: ModelRequest<'_>) -> Result<ModelCompletion, ProviderError> {
        self.requests.lock().expect("lock poisoned").push((
            request.messages.to_vec(),
            request.continuation.map(str::to_string),
        ));
        self.responses
            .lock()
            .expect("lock poisoned")
            .pop_front()
            .unwrap_or_else(|| {
                Err(ProviderError::Request(
                    "no more scripted responses".to_string(),
                ))
            })
    }

    async fn release(&self, continuation: &str) -> Result<(), ProviderError> {
        self.released
            .lock()
            .expect("lock poisoned")
            .push(continuation.to_string());
        Ok(())
    }
}

fn text(content: &str) -> Result<ModelCompletion, ProviderError> {
    Ok(ModelCompletion {
        text: Some(content.to_string()),
        ..ModelCompletion::default()
    })
}

fn calls(tool_calls: Vec<ModelToolCall>) -> Result<ModelCompletion, ProviderError> {
    Ok(ModelCompletion {
        tool_calls,
        ..ModelCompletion::default()
    })
}

fn tool_call(id: &str, name: &str, arguments: serde_json::Value) -> ModelToolCall {
    ModelToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments,
    }
}

fn counting_tool(name: &str, sensitive: bool, counter: Arc<AtomicUsize>) -> ToolSpec {
    ToolSpec::new(name, "count invocations")
        .requires_approval(sensitive)
        .with_handler(move |_args, _deps| {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(ToolOutput::Text(format!("invocation {n}")))
            }
        })
}

fn add_tool() -> ToolSpec {
    ToolSpec::new("add", "add two numbers")
        .with_schema(json!({
            "type": "object",
            "properties": {
                "a": {"type": "integer"},
                "b": {"type": "integer"}
            },
            "required": ["a", "b"],
            "additionalProperties": false
        }))
        .expect("valid schema")
        .with_handler(|args, _deps| async move {
            let a = args.get("a").and_then(|v| v.as_i64()).unwrap_or_default();
            let b = args.get("b").and_then(|v| v.as_i64()).unwrap_or_default();
            Ok(ToolOutput::Text((a + b).to_string()))
        })
}

fn bank_agent(model: Arc<ScriptedModel>, ledger: Ledger) -> Agent {
    Agent::builder()
        .shared_model(model)
        .name("FinanceAgent")
        .system_prompt("You are a helpful assistant for Contoso Bank.")
        .tools(bank_tools())
        .dependency(ledger)
        .build()
        .expect("agent builds")
}

fn tool_results(session: &Session) -> Vec<(String, String, bool)> {
    session
        .messages()
        .iter()
        .flat_map(|message| message.content.iter())
        .filter_map(|part| match part {
            ContentPart::ToolResult {
                tool_call_id,
                content,
                is_error,
                ..
            } => Some((tool_call_id.clone(), content.clone(), *is_error)),
            _ => None,
        })
        .collect()
}

fn ledger_of(agent: &Agent) -> Arc<Ledger> {
    agent
        .inner
        .dependencies
        .require::<Ledger>()
        .expect("ledger registered")
}

fn pending_parts(result: RunResult) -> (Vec<ToolInvocationRequest>, RunHandle) {
    match result {
        RunResult::PendingApprovals { requests, handle } => (requests, handle),
        RunResult::Final { text } => panic!("expected pending approvals, got final '{text}'"),
    }
}

#[tokio::test]
async fn plain_answer_is_final_and_history_starts_with_system_prompt() {
    let model = ScriptedModel::with_responses(vec![text("Hello! How can I help?")]);
    let agent = Agent::builder()
        .shared_model(model.clone())
        .system_prompt("Be brief.")
        .build()
        .expect("agent builds");
    let mut session = Session::new("general");

    let result = agent.run(&mut session, "hi").await.expect("run succeeds");

    assert_eq!(
        result,
        RunResult::Final {
            text: "Hello! How can I help?".to_string()
        }
    );
    let roles = session
        .messages()
        .iter()
        .map(|message| message.role)
        .collect::<Vec<_>>();
    assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
    assert_eq!(model.last_messages()[0], ModelMessage::system("Be brief."));
}

#[tokio::test]
async fn balance_lookup_runs_without_approval() {
    let model = ScriptedModel::with_responses(vec![
        calls(vec![tool_call("call_1", "get_account_balance", json!({}))]),
        text("Your balance is 1250.00 USD."),
    ]);
    let agent = bank_agent(model.clone(), Ledger::new(1250.0, "USD"));
    let mut session = Session::new("finance");

    let result = agent
        .run(&mut session, "What's my balance?")
        .await
        .expect("run succeeds");

    assert_eq!(result.final_text(), Some("Your balance is 1250.00 USD."));
    assert!(!session.has_pending_approvals());
    assert_eq!(
        tool_results(&session),
        vec![(
            "call_1".to_string(),
            "Current balance: 1250.00 USD".to_string(),
            false
        )]
    );
    assert_eq!(model.calls(), 2);
}

#[tokio::test]
async fn transfer_waits_for_approval_then_completes() {
    let model = ScriptedModel::with_responses(vec![
        calls(vec![tool_call(
            "call_pay",
            "submit_payment",
            json!({"amount": 50, "recipient": "Alice", "reference": "INV1"}),
        )]),
        text("Done: 50.00 USD sent to Alice (INV1)."),
    ]);
    let agent = bank_agent(model.clone(), Ledger::new(100.0, "USD"));
    let ledger = ledger_of(&agent);
    let mut session = Session::new("finance");

    let result = agent
        .run(&mut session, "Transfer $50 to Alice, ref INV1")
        .await
        .expect("run succeeds");
    let (requests, handle) = pending_parts(result);

    assert_eq!(
        requests,
        vec![ToolInvocationRequest {
            call_id: "call_pay".to_string(),
            tool: "submit_payment".to_string(),
            arguments: json!({"amount": 50, "recipient": "Alice", "reference": "INV1"}),
            requires_approval: true,
        }]
    );
    assert!(ledger.payments().is_empty());
    assert_eq!(session.pending_run_id(), Some(handle.run_id()));

    let decisions = requests.iter().map(ToolInvocationRequest::approve).collect();
    let result = agent
        .resume(&mut session, decisions, handle)
        .await
        .expect("resume succeeds");

    assert_eq!(
        result.final_text(),
        Some("Done: 50.00 USD sent to Alice (INV1).")
    );
    assert_eq!(ledger.balance(), 50.0);
    let results = tool_results(&session);
    assert_eq!(results.len(), 1);
    assert!(results[0].1.starts_with("Payment of 50.00 USD to Alice submitted"));
    assert!(!results[0].2);
    assert!(!session.has_pending_approvals());
}

#[tokio::test]
async fn mixed_batch_parks_only_sensitive_calls_and_keeps_call_order() {
    let safe_runs = Arc::new(AtomicUsize::new(0));
    let risky_runs = Arc::new(AtomicUsize::new(0));
    let model = ScriptedModel::with_responses(vec![
        calls(vec![
            tool_call("call_a", "risky", json!({})),
            tool_call("call_b", "safe", json!({})),
        ]),
        text("finished"),
    ]);
    let agent = Agent::builder()
        .shared_model(model.clone())
        .tool(counting_tool("risky", true, risky_runs.clone()))
        .tool(counting_tool("safe", false, safe_runs.clone()))
        .build()
        .expect("agent builds");
    let mut session = Session::new("mixed");

    let (requests, handle) = pending_parts(agent.run(&mut session, "go").await.expect("run"));
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].call_id, "call_a");
    assert_eq!(safe_runs.load(Ordering::SeqCst), 1);
    assert_eq!(risky_runs.load(Ordering::SeqCst), 0);

    agent
        .resume(&mut session, vec![requests[0].approve()], handle)
        .await
        .expect("resume succeeds");

    let order = tool_results(&session)
        .into_iter()
        .map(|(id, _, _)| id)
        .collect::<Vec<_>>();
    assert_eq!(order, vec!["call_a", "call_b"]);
    assert_eq!(safe_runs.load(Ordering::SeqCst), 1);
    assert_eq!(risky_runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn denied_calls_never_execute() {
    let runs = Arc::new(AtomicUsize::new(0));
    let model = ScriptedModel::with_responses(vec![
        calls(vec![
            tool_call("call_1", "wire", json!({})),
            tool_call("call_2", "wire", json!({})),
        ]),
        text("Understood, nothing was sent."),
    ]);
    let agent = Agent::builder()
        .shared_model(model)
        .tool(counting_tool("wire", true, runs.clone()))
        .build()
        .expect("agent builds");
    let mut session = Session::new("deny");

    let (requests, handle) = pending_parts(agent.run(&mut session, "wire it").await.expect("run"));
    let decisions = requests.iter().map(ToolInvocationRequest::deny).collect();
    let result = agent
        .resume(&mut session, decisions, handle)
        .await
        .expect("resume succeeds");

    assert!(!result.is_pending());
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    let results = tool_results(&session);
    assert_eq!(results.len(), 2);
    assert!(
        results
            .iter()
            .all(|(_, content, is_error)| *is_error && content.contains("denied"))
    );
}

#[tokio::test]
async fn incomplete_decisions_fail_without_executing_and_keep_the_turn() {
    let runs = Arc::new(AtomicUsize::new(0));
    let model = ScriptedModel::with_responses(vec![
        calls(vec![
            tool_call("call_1", "wire", json!({})),
            tool_call("call_2", "wire", json!({})),
        ]),
        text("ok"),
    ]);
    let agent = Agent::builder()
        .shared_model(model)
        .tool(counting_tool("wire", true, runs.clone()))
        .build()
        .expect("agent builds");
    let mut session = Session::new("partial");

    let (requests, handle) = pending_parts(agent.run(&mut session, "pay").await.expect("run"));
    let len_before = session.len();

    let err = agent
        .resume(&mut session, vec![requests[0].approve()], handle.clone())
        .await
        .expect_err("missing decision");
    match err {
        AgentError::IncompleteApprovalSet {
            missing,
            unexpected,
        } => {
            assert_eq!(missing, vec!["call_2".to_string()]);
            assert!(unexpected.is_empty());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(session.len(), len_before);
    assert!(session.has_pending_approvals());

    let decisions = requests.iter().map(ToolInvocationRequest::approve).collect();
    agent
        .resume(&mut session, decisions, handle)
        .await
        .expect("complete set resumes");
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn replayed_handle_is_stale() {
    let runs = Arc::new(AtomicUsize::new(0));
    let model = ScriptedModel::with_responses(vec![
        calls(vec![tool_call("call_1", "wire", json!({}))]),
        text("sent"),
    ]);
    let agent = Agent::builder()
        .shared_model(model)
        .tool(counting_tool("wire", true, runs.clone()))
        .build()
        .expect("agent builds");
    let mut session = Session::new("replay");

    let (requests, handle) = pending_parts(agent.run(&mut session, "pay").await.expect("run"));
    let decisions: Vec<_> = requests.iter().map(ToolInvocationRequest::approve).collect();

    agent
        .resume(&mut session, decisions.clone(), handle.clone())
        .await
        .expect("first resume");
    let err = agent
        .resume(&mut session, decisions, handle.clone())
        .await
        .expect_err("second resume must fail");

    assert!(matches!(err, AgentError::StaleRunHandle { run_id } if run_id == handle.run_id()));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cloned_session_cannot_redeem_the_handle_again() {
    let runs = Arc::new(AtomicUsize::new(0));
    let model = ScriptedModel::with_responses(vec![
        calls(vec![tool_call("call_1", "wire", json!({}))]),
        text("sent"),
        text("sent again"),
    ]);
    let agent = Agent::builder()
        .shared_model(model)
        .tool(counting_tool("wire", true, runs.clone()))
        .build()
        .expect("agent builds");
    let mut session = Session::new("fork");

    let (requests, handle) = pending_parts(agent.run(&mut session, "pay").await.expect("run"));
    let mut copy = session.clone();
    let decisions: Vec<_> = requests.iter().map(ToolInvocationRequest::approve).collect();

    agent
        .resume(&mut session, decisions.clone(), handle.clone())
        .await
        .expect("original resumes");
    let err = agent
        .resume(&mut copy, decisions, handle)
        .await
        .expect_err("copy must not resume");

    assert!(matches!(err, AgentError::StaleRunHandle { .. }));
    assert!(!copy.has_pending_approvals());
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn turn_can_park_again_after_a_resume() {
    let runs = Arc::new(AtomicUsize::new(0));
    let model = ScriptedModel::with_responses(vec![
        calls(vec![tool_call("call_1", "wire", json!({}))]),
        calls(vec![tool_call("call_2", "wire", json!({}))]),
        text("both sent"),
    ]);
    let agent = Agent::builder()
        .shared_model(model)
        .tool(counting_tool("wire", true, runs.clone()))
        .build()
        .expect("agent builds");
    let mut session = Session::new("twice");

    let (first_requests, first_handle) =
        pending_parts(agent.run(&mut session, "pay twice").await.expect("run"));
    let (second_requests, second_handle) = pending_parts(
        agent
            .resume(
                &mut session,
                vec![first_requests[0].approve()],
                first_handle.clone(),
            )
            .await
            .expect("first resume"),
    );

    assert_eq!(second_requests.len(), 1);
    assert_eq!(second_requests[0].call_id, "call_2");
    assert_ne!(second_handle, first_handle);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let err = agent
        .resume(
            &mut session,
            vec![second_requests[0].approve()],
            first_handle,
        )
        .await
        .expect_err("first handle is spent");
    assert!(matches!(err, AgentError::StaleRunHandle { .. }));
    assert_eq!(session.pending_run_id(), Some(second_handle.run_id()));

    let result = agent
        .resume(
            &mut session,
            vec![second_requests[0].approve()],
            second_handle,
        )
        .await
        .expect("second resume");

    assert_eq!(result.final_text(), Some("both sent"));
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    let roles = session
        .messages()
        .iter()
        .map(|message| message.role)
        .collect::<Vec<_>>();
    assert_eq!(
        roles,
        vec![
            Role::User,
            Role::Assistant,
            Role::User,
            Role::User,
            Role::Assistant,
            Role::User,
            Role::User,
            Role::Assistant,
        ]
    );
    let ids = tool_results(&session)
        .into_iter()
        .map(|(id, _, is_error)| (id, is_error))
        .collect::<Vec<_>>();
    assert_eq!(
        ids,
        vec![("call_1".to_string(), false), ("call_2".to_string(), false)]
    );
}

#[tokio::test]
async fn unknown_tool_after_resume_keeps_outputs_and_marks_the_failure() {
    let runs = Arc::new(AtomicUsize::new(0));
    let model = ScriptedModel::with_responses(vec![
        calls(vec![tool_call("call_1", "wire", json!({}))]),
        calls(vec![tool_call("call_2", "format_disk", json!({}))]),
        text("recovered"),
    ]);
    let agent = Agent::builder()
        .shared_model(model)
        .tool(counting_tool("wire", true, runs.clone()))
        .build()
        .expect("agent builds");
    let mut session = Session::new("unknown-after-resume");

    let (requests, handle) = pending_parts(agent.run(&mut session, "pay").await.expect("run"));
    let err = agent
        .resume(&mut session, vec![requests[0].approve()], handle)
        .await
        .expect_err("unknown tool");

    assert!(matches!(err, AgentError::UnknownTool { ref tool } if tool == "format_disk"));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(!session.has_pending_approvals());
    assert_eq!(session.len(), 5);
    assert_eq!(
        tool_results(&session),
        vec![("call_1".to_string(), "invocation 1".to_string(), false)]
    );
    let last = session.last_message().expect("failure note");
    assert_eq!(last.role, Role::Assistant);
    assert_eq!(last.tool_calls().count(), 0);
    assert!(
        last.text()
            .starts_with("[turn failed: backend requested unknown tool 'format_disk'")
    );

    let result = agent
        .run(&mut session, "anything else?")
        .await
        .expect("session usable again");
    assert_eq!(result.final_text(), Some("recovered"));
}

#[tokio::test]
async fn backend_failure_after_resume_keeps_the_approved_output() {
    let runs = Arc::new(AtomicUsize::new(0));
    let model = ScriptedModel::with_responses(vec![calls(vec![tool_call(
        "call_1",
        "wire",
        json!({}),
    )])]);
    let agent = Agent::builder()
        .shared_model(model)
        .tool(counting_tool("wire", true, runs.clone()))
        .build()
        .expect("agent builds");
    let mut session = Session::new("offline-after-resume");

    let (requests, handle) = pending_parts(agent.run(&mut session, "pay").await.expect("run"));
    let err = agent
        .resume(&mut session, vec![requests[0].approve()], handle)
        .await
        .expect_err("backend down");

    assert!(matches!(err, AgentError::BackendUnavailable(_)));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(session.len(), 5);
    assert_eq!(
        tool_results(&session),
        vec![("call_1".to_string(), "invocation 1".to_string(), false)]
    );
    assert!(
        session
            .last_message()
            .is_some_and(|message| message.text().starts_with("[turn failed:"))
    );
}

#[tokio::test]
async fn handle_from_another_session_is_stale() {
    let model = ScriptedModel::with_responses(vec![
        calls(vec![tool_call("call_1", "wire", json!({}))]),
    ]);
    let agent = Agent::builder()
        .shared_model(model)
        .tool(counting_tool("wire", true, Arc::new(AtomicUsize::new(0))))
        .build()
        .expect("agent builds");
    let mut session = Session::new("one");
    let mut other = Session::new("two");

    let (requests, handle) = pending_parts(agent.run(&mut session, "pay").await.expect("run"));
    let err = agent
        .resume(&mut other, vec![requests[0].approve()], handle)
        .await
        .expect_err("wrong session");

    assert!(matches!(err, AgentError::StaleRunHandle { .. }));
    assert!(session.has_pending_approvals());
}

#[tokio::test]
async fn run_is_refused_until_the_pending_turn_is_aborted() {
    let runs = Arc::new(AtomicUsize::new(0));
    let model = ScriptedModel::with_responses(vec![
        Ok(ModelCompletion {
            tool_calls: vec![tool_call("call_1", "wire", json!({}))],
            continuation: Some("cont-1".to_string()),
            ..ModelCompletion::default()
        }),
        text("Fresh start."),
    ]);
    let agent = Agent::builder()
        .shared_model(model.clone())
        .tool(counting_tool("wire", true, runs.clone()))
        .build()
        .expect("agent builds");
    let mut session = Session::new("abort");

    let (_, handle) = pending_parts(agent.run(&mut session, "pay").await.expect("run"));
    assert_eq!(session.continuation(), Some("cont-1"));

    let err = agent
        .run(&mut session, "something else")
        .await
        .expect_err("approvals outstanding");
    assert!(matches!(
        err,
        AgentError::ApprovalsOutstanding { ref session_id, run_id }
            if session_id == "abort" && run_id == handle.run_id()
    ));

    agent
        .abort(&mut session, handle.clone())
        .await
        .expect("abort succeeds");
    assert_eq!(model.released(), vec!["cont-1".to_string()]);
    assert!(!session.has_pending_approvals());
    assert_eq!(session.continuation(), None);
    let results = tool_results(&session);
    assert!(results[0].2 && results[0].1.contains("cancelled"));
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    let err = agent
        .abort(&mut session, handle)
        .await
        .expect_err("already aborted");
    assert!(matches!(err, AgentError::StaleRunHandle { .. }));

    let result = agent
        .run(&mut session, "something else")
        .await
        .expect("run works again");
    assert_eq!(result.final_text(), Some("Fresh start."));
    assert_eq!(model.continuations(), vec![None, None]);
}

#[tokio::test]
async fn continuation_is_sent_back_on_the_next_round_trip() {
    let model = ScriptedModel::with_responses(vec![
        Ok(ModelCompletion {
            tool_calls: vec![tool_call("call_1", "add", json!({"a": 2, "b": 3}))],
            continuation: Some("cont-7".to_string()),
            ..ModelCompletion::default()
        }),
        text("5"),
    ]);
    let agent = Agent::builder()
        .shared_model(model.clone())
        .tool(add_tool())
        .build()
        .expect("agent builds");
    let mut session = Session::new("math");

    agent.run(&mut session, "add").await.expect("run succeeds");

    assert_eq!(
        model.continuations(),
        vec![None, Some("cont-7".to_string())]
    );
}

#[tokio::test]
async fn unknown_tool_rolls_back_to_pre_turn_history() {
    let model = ScriptedModel::with_responses(vec![
        text("Hi there."),
        calls(vec![tool_call("call_1", "format_disk", json!({}))]),
    ]);
    let agent = Agent::builder()
        .shared_model(model)
        .tool(add_tool())
        .build()
        .expect("agent builds");
    let mut session = Session::new("unknown");

    agent.run(&mut session, "hello").await.expect("first turn");
    let before = session.messages().to_vec();

    let err = agent
        .run(&mut session, "clean up")
        .await
        .expect_err("unknown tool");

    assert!(matches!(err, AgentError::UnknownTool { ref tool } if tool == "format_disk"));
    assert_eq!(session.messages(), before.as_slice());
    assert!(!session.has_pending_approvals());
}

#[tokio::test]
async fn backend_failure_on_first_round_trip_rolls_back() {
    let model = ScriptedModel::with_responses(vec![Err(ProviderError::Request(
        "connection refused".to_string(),
    ))]);
    let agent = Agent::builder()
        .shared_model(model)
        .system_prompt("You are helpful.")
        .build()
        .expect("agent builds");
    let mut session = Session::new("offline");

    let err = agent.run(&mut session, "hi").await.expect_err("backend down");

    assert!(matches!(err, AgentError::BackendUnavailable(_)));
    assert!(session.is_empty());
}

#[tokio::test]
async fn backend_failure_after_tool_outputs_keeps_executed_batch() {
    let model = ScriptedModel::with_responses(vec![calls(vec![tool_call(
        "call_1",
        "add",
        json!({"a": 1, "b": 2}),
    )])]);
    let agent = Agent::builder()
        .shared_model(model)
        .tool(add_tool())
        .build()
        .expect("agent builds");
    let mut session = Session::new("flaky");

    let err = agent.run(&mut session, "add").await.expect_err("backend down");

    assert!(matches!(err, AgentError::BackendUnavailable(_)));
    assert_eq!(session.len(), 4);
    assert_eq!(
        tool_results(&session),
        vec![("call_1".to_string(), "3".to_string(), false)]
    );
    let last = session.last_message().expect("failure note");
    assert_eq!(last.role, Role::Assistant);
    assert!(last.text().starts_with("[turn failed: backend unavailable"));
}

#[tokio::test]
async fn max_iterations_error_when_tool_loop_never_finishes() {
    let model = ScriptedModel::with_responses(vec![calls(vec![tool_call(
        "call_3",
        "add",
        json!({"a": 1, "b": 1}),
    )])]);
    let agent = Agent::builder()
        .shared_model(model)
        .tool(add_tool())
        .max_iterations(1)
        .build()
        .expect("agent builds");

    let err = agent
        .run(&mut Session::new("loop"), "loop")
        .await
        .expect_err("must fail");
    assert!(matches!(
        err,
        AgentError::MaxIterationsReached { max_iterations: 1 }
    ));
}

#[tokio::test]
async fn invalid_arguments_become_error_outputs() {
    let model = ScriptedModel::with_responses(vec![
        calls(vec![tool_call("call_4", "add", json!({"a": 1}))]),
        text("I need both numbers."),
    ]);
    let agent = Agent::builder()
        .shared_model(model)
        .tool(add_tool())
        .build()
        .expect("agent builds");
    let mut session = Session::new("args");

    let result = agent.run(&mut session, "add").await.expect("run succeeds");

    assert_eq!(result.final_text(), Some("I need both numbers."));
    let results = tool_results(&session);
    assert!(results[0].2);
    assert!(results[0].1.contains("missing required field"));
}

#[tokio::test]
async fn dependency_override_is_used_for_tool_execution() {
    let model = ScriptedModel::with_responses(vec![
        calls(vec![tool_call("call_5", "read_dep", json!({}))]),
        text("done"),
    ]);
    let dep_tool = ToolSpec::new("read_dep", "read number").with_handler(|_args, deps| {
        let value = deps.get::<u32>().map(|v| *v).unwrap_or(0);
        async move { Ok(ToolOutput::Text(value.to_string())) }
    });
    let agent = Agent::builder()
        .shared_model(model)
        .tool(dep_tool)
        .dependency(1_u32)
        .dependency_override(9_u32)
        .build()
        .expect("agent builds");
    let mut session = Session::new("deps");

    agent.run(&mut session, "dep").await.expect("run succeeds");

    assert_eq!(
        tool_results(&session),
        vec![("call_5".to_string(), "9".to_string(), false)]
    );
}

#[test]
fn builder_rejects_missing_model_and_duplicate_tools() {
    let err = Agent::builder().build().expect_err("no model");
    assert!(matches!(err, AgentError::Config(_)));

    let err = Agent::builder()
        .shared_model(ScriptedModel::with_responses(Vec::new()))
        .tool(add_tool())
        .tool(add_tool())
        .build()
        .expect_err("duplicate");
    assert!(matches!(err, AgentError::Tool(ToolError::DuplicateTool(ref name)) if name == "add"));

    let err = Agent::builder()
        .shared_model(ScriptedModel::with_responses(Vec::new()))
        .max_iterations(0)
        .build()
        .expect_err("zero iterations");
    assert!(matches!(err, AgentError::Config(_)));
}

struct Recorder {
    label: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl RunMiddleware for Recorder {
    async fn handle(&self, ctx: &mut RunContext<'_>, next: RunNext<'_>) -> Result<(), AgentError> {
        self.log
            .lock()
            .expect("lock poisoned")
            .push(format!("{}:before", self.label));
        next.run(ctx).await?;
        self.log
            .lock()
            .expect("lock poisoned")
            .push(format!("{}:after", self.label));
        Ok(())
    }
}

struct CannedAnswer(Option<&'static str>);

#[async_trait]
impl RunMiddleware for CannedAnswer {
    async fn handle(&self, ctx: &mut RunContext<'_>, _next: RunNext<'_>) -> Result<(), AgentError> {
        ctx.result = self.0.map(|text| RunResult::Final {
            text: text.to_string(),
        });
        Ok(())
    }
}

#[tokio::test]
async fn run_middleware_nests_in_registration_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let model = ScriptedModel::with_responses(vec![text("hello")]);
    let agent = Agent::builder()
        .shared_model(model)
        .middleware(Recorder {
            label: "a",
            log: log.clone(),
        })
        .middleware(Recorder {
            label: "b",
            log: log.clone(),
        })
        .build()
        .expect("agent builds");

    agent
        .run(&mut Session::new("mw"), "hi")
        .await
        .expect("run succeeds");

    assert_eq!(
        *log.lock().expect("lock poisoned"),
        vec!["a:before", "b:before", "b:after", "a:after"]
    );
}

#[tokio::test]
async fn short_circuiting_middleware_skips_the_backend() {
    let model = ScriptedModel::with_responses(vec![text("from backend")]);
    let agent = Agent::builder()
        .shared_model(model.clone())
        .middleware(CannedAnswer(Some("from cache")))
        .build()
        .expect("agent builds");
    let mut session = Session::new("cache");

    let result = agent.run(&mut session, "hi").await.expect("run succeeds");

    assert_eq!(result.final_text(), Some("from cache"));
    assert_eq!(model.calls(), 0);
    assert!(session.is_empty());

    let agent = Agent::builder()
        .shared_model(model.clone())
        .middleware(CannedAnswer(None))
        .build()
        .expect("agent builds");
    let err = agent
        .run(&mut session, "hi")
        .await
        .expect_err("no result");
    assert!(matches!(err, AgentError::MissingRunResult));
    assert_eq!(model.calls(), 0);
}

struct ArgumentRewriter;

#[async_trait]
impl ToolMiddleware for ArgumentRewriter {
    async fn handle(
        &self,
        ctx: &mut ToolInvocationContext,
        next: ToolNext<'_>,
    ) -> Result<(), ToolError> {
        ctx.call.arguments = json!({"a": 40, "b": 2});
        next.run(ctx).await
    }
}

struct Blocker;

#[async_trait]
impl ToolMiddleware for Blocker {
    async fn handle(
        &self,
        ctx: &mut ToolInvocationContext,
        _next: ToolNext<'_>,
    ) -> Result<(), ToolError> {
        if ctx.call.name == "add" {
            ctx.result = Some(ToolExecution::failure("blocked by policy"));
        }
        Ok(())
    }
}

#[tokio::test]
async fn tool_middleware_can_rewrite_arguments() {
    let model = ScriptedModel::with_responses(vec![
        calls(vec![tool_call("call_1", "add", json!({"a": 1, "b": 1}))]),
        text("42"),
    ]);
    let agent = Agent::builder()
        .shared_model(model)
        .tool(add_tool())
        .tool_middleware(ArgumentRewriter)
        .build()
        .expect("agent builds");
    let mut session = Session::new("rewrite");

    agent.run(&mut session, "add").await.expect("run succeeds");

    assert_eq!(
        tool_results(&session),
        vec![("call_1".to_string(), "42".to_string(), false)]
    );
}

#[tokio::test]
async fn tool_middleware_can_short_circuit_a_call() {
    let runs = Arc::new(AtomicUsize::new(0));
    let model = ScriptedModel::with_responses(vec![
        calls(vec![
            tool_call("call_1", "add", json!({"a": 1, "b": 1})),
            tool_call("call_2", "count", json!({})),
        ]),
        text("ok"),
    ]);
    let agent = Agent::builder()
        .shared_model(model)
        .tool(add_tool())
        .tool(counting_tool("count", false, runs.clone()))
        .tool_middleware(Blocker)
        .build()
        .expect("agent builds");
    let mut session = Session::new("blocked");

    agent.run(&mut session, "go").await.expect("run succeeds");

    let results = tool_results(&session);
    assert_eq!(
        results[0],
        ("call_1".to_string(), "blocked by policy".to_string(), true)
    );
    assert!(results[1].2);
    assert!(results[1].1.contains("skipped by middleware"));
    assert_eq!(runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn stream_reports_tool_progress_and_final_answer() {
    let model = ScriptedModel::with_responses(vec![
        calls(vec![tool_call("call_1", "add", json!({"a": 2, "b": 3}))]),
        text("all done"),
    ]);
    let agent = Agent::builder()
        .shared_model(model)
        .tool(add_tool())
        .build()
        .expect("agent builds");
    let mut session = Session::new("stream");

    let events = agent
        .run_stream(&mut session, ModelMessage::user("add"))
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()
        .expect("events ok");

    assert_eq!(
        events,
        vec![
            AgentEvent::ToolCall {
                tool: "add".to_string(),
                args_json: json!({"a": 2, "b": 3}),
                tool_call_id: "call_1".to_string(),
            },
            AgentEvent::ToolResult {
                tool: "add".to_string(),
                result_text: "5".to_string(),
                tool_call_id: "call_1".to_string(),
                is_error: false,
            },
            AgentEvent::Text {
                content: "all done".to_string()
            },
            AgentEvent::FinalResponse {
                content: "all done".to_string()
            },
        ]
    );
    assert_eq!(session.len(), 4);
}

#[tokio::test]
async fn stream_forwards_image_reference_and_yields_the_joke() {
    let model = ScriptedModel::with_responses(vec![text("Why did the penguin cross the ice?")]);
    let agent = Agent::builder()
        .shared_model(model.clone())
        .name("Joker")
        .system_prompt("You are good at telling jokes.")
        .build()
        .expect("agent builds");
    let mut session = Session::with_generated_id();
    let message = ModelMessage::user("Tell me a joke about this image?").with_part(ContentPart::Uri {
        uri: "https://example.com/pinguino.jpg".to_string(),
        media_type: "image/jpeg".to_string(),
    });

    let texts = agent
        .run_stream(&mut session, message)
        .filter_map(|event| async move {
            match event {
                Ok(AgentEvent::Text { content }) => Some(content),
                _ => None,
            }
        })
        .collect::<Vec<_>>()
        .await;

    assert_eq!(texts, vec!["Why did the penguin cross the ice?".to_string()]);
    let sent = model.last_messages();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].content.len(), 2);
    assert!(matches!(
        &sent[1].content[1],
        ContentPart::Uri { media_type, .. } if media_type == "image/jpeg"
    ));
}

#[tokio::test]
async fn stream_surfaces_approvals_and_resumes() {
    let runs = Arc::new(AtomicUsize::new(0));
    let model = ScriptedModel::with_responses(vec![
        calls(vec![tool_call("call_1", "wire", json!({}))]),
        text("wired"),
    ]);
    let agent = Agent::builder()
        .shared_model(model)
        .tool(counting_tool("wire", true, runs.clone()))
        .build()
        .expect("agent builds");
    let mut session = Session::new("stream-approval");

    let events = agent
        .run_stream(&mut session, ModelMessage::user("wire"))
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()
        .expect("events ok");

    let Some(AgentEvent::ApprovalRequired { requests, handle }) = events.last().cloned() else {
        panic!("expected an approval event, got {events:?}");
    };
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    let decisions = requests.iter().map(ToolInvocationRequest::approve).collect();
    let events = agent
        .resume_stream(&mut session, decisions, handle)
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()
        .expect("events ok");

    assert!(matches!(
        events.first(),
        Some(AgentEvent::ToolResult { is_error: false, .. })
    ));
    assert_eq!(
        events.last(),
        Some(&AgentEvent::FinalResponse {
            content: "wired".to_string()
        })
    );
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stream_ends_with_the_turn_error() {
    let model = ScriptedModel::with_responses(Vec::new());
    let agent = Agent::builder()
        .shared_model(model)
        .build()
        .expect("agent builds");
    let mut session = Session::new("stream-error");

    let events = agent
        .run_stream(&mut session, ModelMessage::user("hi"))
        .collect::<Vec<_>>()
        .await;

    assert_eq!(events.len(), 1);
    assert!(matches!(
        events[0],
        Err(AgentError::BackendUnavailable(_))
    ));
}

#[tokio::test]
async fn agent_as_tool_returns_the_inner_final_text() {
    let weather_model = ScriptedModel::with_responses(vec![text("Sunny, 21°C in Paris.")]);
    let weather_agent = Agent::builder()
        .shared_model(weather_model.clone())
        .name("WeatherAgent")
        .build()
        .expect("agent builds");

    let main_model = ScriptedModel::with_responses(vec![
        calls(vec![tool_call(
            "call_1",
            "WeatherLookup",
            json!({"query": "Paris"}),
        )]),
        text("Il fait beau à Paris."),
    ]);
    let main_agent = Agent::builder()
        .shared_model(main_model)
        .tool(weather_agent.as_tool(
            "WeatherLookup",
            "Look up weather information for any location",
            "query",
            "The weather query or location",
        ))
        .build()
        .expect("agent builds");
    let mut session = Session::new("main");

    let result = main_agent
        .run(&mut session, "Quel temps fait-il à Paris ?")
        .await
        .expect("run succeeds");

    assert_eq!(result.final_text(), Some("Il fait beau à Paris."));
    assert_eq!(
        tool_results(&session),
        vec![(
            "call_1".to_string(),
            "Sunny, 21°C in Paris.".to_string(),
            false
        )]
    );
    assert_eq!(
        weather_model.last_messages(),
        vec![ModelMessage::user("Paris")]
    );
}

#[tokio::test]
async fn agent_as_tool_refuses_nested_approvals() {
    let runs = Arc::new(AtomicUsize::new(0));
    let inner_model = ScriptedModel::with_responses(vec![calls(vec![tool_call(
        "inner_1",
        "wire",
        json!({}),
    )])]);
    let inner = Agent::builder()
        .shared_model(inner_model)
        .name("Payments")
        .description("Sends money")
        .tool(counting_tool("wire", true, runs.clone()))
        .build()
        .expect("agent builds");

    let outer_model = ScriptedModel::with_responses(vec![
        calls(vec![tool_call("call_1", "Payments", json!({"task": "pay Bob"}))]),
        text("I could not send the payment."),
    ]);
    let outer = Agent::builder()
        .shared_model(outer_model)
        .tool(inner.as_default_tool())
        .build()
        .expect("agent builds");
    let mut session = Session::new("outer");

    let result = outer.run(&mut session, "pay Bob").await.expect("run succeeds");

    assert_eq!(result.final_text(), Some("I could not send the payment."));
    let results = tool_results(&session);
    assert!(results[0].2);
    assert!(results[0].1.contains("approval"));
    assert_eq!(runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn run_with_gate_drives_the_turn_to_completion() {
    let model = ScriptedModel::with_responses(vec![
        calls(vec![tool_call(
            "call_pay",
            "submit_payment",
            json!({"amount": 20, "recipient": "Bob", "reference": "R2"}),
        )]),
        text("Paid Bob."),
    ]);
    let agent = bank_agent(model, Ledger::new(100.0, "USD"));
    let ledger = ledger_of(&agent);
    let gate = PolicyGate::new(|request: &ToolInvocationRequest| {
        request.arguments["amount"].as_f64().unwrap_or(f64::MAX) <= 25.0
    });

    let text = agent
        .run_with_gate(&mut Session::new("gate"), "Pay Bob 20", &gate)
        .await
        .expect("run succeeds");

    assert_eq!(text, "Paid Bob.");
    assert_eq!(ledger.balance(), 80.0);
}

struct BrokenGate;

#[async_trait]
impl ApprovalGate for BrokenGate {
    async fn decide(
        &self,
        _requests: &[ToolInvocationRequest],
    ) -> Result<Vec<ApprovalDecision>, AgentError> {
        Err(AgentError::Gate("operator unavailable".to_string()))
    }
}

#[tokio::test]
async fn run_with_gate_aborts_the_turn_when_the_gate_fails() {
    let model = ScriptedModel::with_responses(vec![calls(vec![tool_call(
        "call_pay",
        "submit_payment",
        json!({"amount": 20, "recipient": "Bob", "reference": "R2"}),
    )])]);
    let agent = bank_agent(model, Ledger::new(100.0, "USD"));
    let ledger = ledger_of(&agent);
    let mut session = Session::new("gate-error");

    let err = agent
        .run_with_gate(&mut session, "Pay Bob 20", &BrokenGate)
        .await
        .expect_err("gate fails");

    assert!(matches!(err, AgentError::Gate(_)));
    assert!(!session.has_pending_approvals());
    assert!(ledger.payments().is_empty());
    assert!(tool_results(&session)[0].1.contains("cancelled"));
}
