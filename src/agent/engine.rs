use std::collections::HashMap;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{AgentEvent, AgentInner, EventSink, RunHandle, RunResult, TurnRequest};
use crate::approval::{ApprovalDecision, ToolInvocationRequest, match_decisions};
use crate::error::AgentError;
use crate::llm::{ContentPart, ModelMessage, ModelRequest, ModelToolCall, ModelToolChoice, Role};
use crate::middleware::{RunContext, RunNext, ToolInvocationContext, ToolNext};
use crate::session::{PendingTurn, Session};
use crate::tools::ToolExecution;

impl AgentInner {
    pub(crate) async fn dispatch(
        &self,
        session: &mut Session,
        request: TurnRequest,
        events: Option<EventSink>,
    ) -> Result<RunResult, AgentError> {
        let mut ctx = RunContext::new(session, request, self.config.name.clone(), events);
        RunNext::new(&self.run_middleware, self).run(&mut ctx).await?;
        ctx.result.take().ok_or(AgentError::MissingRunResult)
    }

    /// End of the run middleware chain.
    pub(crate) async fn execute(&self, ctx: &mut RunContext<'_>) -> Result<RunResult, AgentError> {
        let events = ctx.events.clone();
        match ctx.request.clone() {
            TurnRequest::Input(input) => self.start_turn(ctx.session, input, events.as_ref()).await,
            TurnRequest::Resume { decisions, handle } => {
                self.resume_turn(ctx.session, decisions, handle, events.as_ref())
                    .await
            }
        }
    }

    async fn start_turn(
        &self,
        session: &mut Session,
        input: ModelMessage,
        events: Option<&EventSink>,
    ) -> Result<RunResult, AgentError> {
        if let Some(pending) = session.pending() {
            return Err(AgentError::ApprovalsOutstanding {
                session_id: session.id().to_string(),
                run_id: pending.run_id,
            });
        }

        let turn_start = session.len();
        if session.is_empty() {
            if let Some(system_prompt) = &self.config.system_prompt {
                session.push(ModelMessage::system(system_prompt.clone()));
            }
        }
        session.push(input);

        self.drive(session, turn_start, turn_start, events).await
    }

    /// Round-trips with the backend until it answers in plain text or parks
    /// the turn on sensitive calls. `checkpoint` is where history is cut back
    /// to if the turn fails.
    async fn drive(
        &self,
        session: &mut Session,
        turn_start: usize,
        mut checkpoint: usize,
        events: Option<&EventSink>,
    ) -> Result<RunResult, AgentError> {
        let tool_choice = if self.definitions.is_empty() {
            ModelToolChoice::None
        } else {
            ModelToolChoice::Auto
        };

        for iteration in 0..self.config.max_iterations {
            debug!(session_id = %session.id(), iteration, "invoking backend");
            let request = ModelRequest {
                messages: session.messages(),
                tools: &self.definitions,
                tool_choice: tool_choice.clone(),
                continuation: session.continuation(),
            };
            let completion = match self.model.invoke(request).await {
                Ok(completion) => completion,
                Err(err) => {
                    warn!(session_id = %session.id(), error = %err, "backend call failed");
                    return Err(fail_turn(
                        session,
                        turn_start,
                        checkpoint,
                        AgentError::BackendUnavailable(err),
                    ));
                }
            };

            if let Some(thinking) = completion.thinking.clone() {
                emit(events, AgentEvent::Thinking { content: thinking });
            }
            if let Some(text) = completion.text.as_ref().filter(|text| !text.is_empty()) {
                emit(events, AgentEvent::Text {
                    content: text.clone(),
                });
            }

            if completion.tool_calls.is_empty() {
                let text = completion.text.unwrap_or_default();
                session.set_continuation(completion.continuation);
                session.push(ModelMessage::assistant(Some(text.clone()), Vec::new()));
                emit(events, AgentEvent::FinalResponse {
                    content: text.clone(),
                });
                return Ok(RunResult::Final { text });
            }

            if let Some(unknown) = completion
                .tool_calls
                .iter()
                .find(|call| !self.tools.contains(&call.name))
            {
                warn!(
                    session_id = %session.id(),
                    tool = %unknown.name,
                    "backend requested an unregistered tool"
                );
                let tool = unknown.name.clone();
                return Err(fail_turn(
                    session,
                    turn_start,
                    checkpoint,
                    AgentError::UnknownTool { tool },
                ));
            }

            session.set_continuation(completion.continuation);
            let batch = completion.tool_calls;
            session.push(ModelMessage::assistant(completion.text, batch.clone()));

            let mut requests = Vec::new();
            let mut completed = HashMap::new();
            for call in &batch {
                emit(events, AgentEvent::ToolCall {
                    tool: call.name.clone(),
                    args_json: call.arguments.clone(),
                    tool_call_id: call.id.clone(),
                });

                let sensitive = self
                    .tools
                    .get(&call.name)
                    .map(|tool| tool.is_sensitive())
                    .unwrap_or(true);
                if sensitive {
                    requests.push(ToolInvocationRequest::from_call(call, true));
                    continue;
                }

                let execution = self.invoke_tool(session.id(), call).await;
                emit_result(events, call, &execution);
                completed.insert(call.id.clone(), execution);
            }

            if !requests.is_empty() {
                let run_id = Uuid::new_v4();
                let handle = RunHandle::new(run_id, session.id());
                info!(
                    session_id = %session.id(),
                    %run_id,
                    pending = requests.len(),
                    "turn parked on approvals"
                );
                session.set_pending(PendingTurn {
                    run_id,
                    turn_start,
                    batch,
                    completed,
                    requests: requests.clone(),
                });
                emit(events, AgentEvent::ApprovalRequired {
                    requests: requests.clone(),
                    handle: handle.clone(),
                });
                return Ok(RunResult::PendingApprovals { requests, handle });
            }

            session.push(tool_results_message(&batch, &mut completed));
            checkpoint = session.len();
        }

        Err(AgentError::MaxIterationsReached {
            max_iterations: self.config.max_iterations,
        })
    }

    async fn resume_turn(
        &self,
        session: &mut Session,
        decisions: Vec<ApprovalDecision>,
        handle: RunHandle,
        events: Option<&EventSink>,
    ) -> Result<RunResult, AgentError> {
        let verdicts = {
            let pending = pending_for(session, &handle)?;
            match_decisions(&pending.requests, &decisions)?
        };
        let Some(mut pending) = session.take_pending() else {
            return Err(AgentError::StaleRunHandle {
                run_id: handle.run_id(),
            });
        };
        info!(session_id = %session.id(), run_id = %handle.run_id(), "resuming turn");

        let ordered = pending
            .requests
            .iter()
            .map(|request| request.respond(verdicts.get(&request.call_id).copied().unwrap_or(false)))
            .collect::<Vec<_>>();
        session.push(ModelMessage::approval_responses(&ordered));

        for call in &pending.batch {
            if pending.completed.contains_key(&call.id) {
                continue;
            }
            let approved = verdicts.get(&call.id).copied().unwrap_or(false);
            let execution = if approved {
                self.invoke_tool(session.id(), call).await
            } else {
                info!(tool = %call.name, call_id = %call.id, "tool call denied");
                ToolExecution::failure(format!(
                    "The user denied the call to '{}'. The tool was not executed.",
                    call.name
                ))
            };
            emit_result(events, call, &execution);
            pending.completed.insert(call.id.clone(), execution);
        }

        session.push(tool_results_message(&pending.batch, &mut pending.completed));
        let checkpoint = session.len();
        self.drive(session, pending.turn_start, checkpoint, events).await
    }

    pub(crate) async fn abort_turn(
        &self,
        session: &mut Session,
        handle: RunHandle,
    ) -> Result<(), AgentError> {
        pending_for(session, &handle)?;
        let Some(mut pending) = session.take_pending() else {
            return Err(AgentError::StaleRunHandle {
                run_id: handle.run_id(),
            });
        };
        info!(session_id = %session.id(), run_id = %handle.run_id(), "aborting turn");

        for call in &pending.batch {
            pending
                .completed
                .entry(call.id.clone())
                .or_insert_with(|| {
                    ToolExecution::failure(format!(
                        "The call to '{}' was cancelled before approval. The tool was not executed.",
                        call.name
                    ))
                });
        }
        session.push(tool_results_message(&pending.batch, &mut pending.completed));

        if let Some(continuation) = session.take_continuation() {
            if let Err(err) = self.model.release(&continuation).await {
                warn!(session_id = %session.id(), error = %err, "failed to release continuation");
                return Err(AgentError::BackendUnavailable(err));
            }
        }
        Ok(())
    }

    /// Runs one approved or non-sensitive call through the tool middleware.
    /// Failures come back as error outputs.
    async fn invoke_tool(&self, session_id: &str, call: &ModelToolCall) -> ToolExecution {
        let mut ctx = ToolInvocationContext::new(session_id, call.clone());
        let next = ToolNext::new(&self.tool_middleware, &self.tools, &self.dependencies);
        match next.run(&mut ctx).await {
            Ok(()) => ctx.result.unwrap_or_else(|| {
                ToolExecution::failure(format!(
                    "The call to '{}' was skipped by middleware.",
                    call.name
                ))
            }),
            Err(err) => {
                warn!(tool = %call.name, call_id = %call.id, error = %err, "tool middleware failed");
                ToolExecution::failure(err.to_string())
            }
        }
    }
}

/// Cuts history back to `checkpoint`. When tool outputs of this turn are kept,
/// an assistant note records that the turn ended in `err`.
fn fail_turn(
    session: &mut Session,
    turn_start: usize,
    checkpoint: usize,
    err: AgentError,
) -> AgentError {
    session.truncate(checkpoint);
    if checkpoint > turn_start {
        session.push(ModelMessage::assistant(
            Some(format!("[turn failed: {err}]")),
            Vec::new(),
        ));
    }
    err
}

fn pending_for<'s>(session: &'s Session, handle: &RunHandle) -> Result<&'s PendingTurn, AgentError> {
    session
        .pending()
        .filter(|pending| {
            handle.session_id() == session.id() && pending.run_id == handle.run_id()
        })
        .ok_or(AgentError::StaleRunHandle {
            run_id: handle.run_id(),
        })
}

/// One user message holding the outputs of `batch`, in call order.
fn tool_results_message(
    batch: &[ModelToolCall],
    completed: &mut HashMap<String, ToolExecution>,
) -> ModelMessage {
    let content = batch
        .iter()
        .map(|call| {
            let execution = completed.remove(&call.id).unwrap_or_else(|| {
                ToolExecution::failure(format!("No output was recorded for '{}'.", call.name))
            });
            ContentPart::ToolResult {
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                content: execution.content,
                is_error: execution.is_error,
            }
        })
        .collect();
    ModelMessage::new(Role::User, content)
}

fn emit(events: Option<&EventSink>, event: AgentEvent) {
    if let Some(events) = events {
        // The receiver is gone once a stream is dropped; the turn still finishes.
        let _ = events.send(event);
    }
}

fn emit_result(events: Option<&EventSink>, call: &ModelToolCall, execution: &ToolExecution) {
    emit(events, AgentEvent::ToolResult {
        tool: call.name.clone(),
        result_text: execution.content.clone(),
        tool_call_id: call.id.clone(),
        is_error: execution.is_error,
    });
}
