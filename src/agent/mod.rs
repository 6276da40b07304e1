mod engine;

use std::sync::Arc;

use async_stream::try_stream;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::approval::{ApprovalDecision, ApprovalGate, ToolInvocationRequest, collect_decisions};
use crate::error::{AgentError, ToolError};
use crate::llm::{ChatModel, ModelMessage, ModelToolDefinition};
use crate::middleware::{RunMiddleware, ToolMiddleware};
use crate::session::Session;
use crate::tools::{DependencyMap, ToolOutput, ToolRegistry, ToolSpec};

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub name: Option<String>,
    pub description: Option<String>,
    pub system_prompt: Option<String>,
    /// Backend round-trips allowed per `run` or `resume` call.
    pub max_iterations: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: None,
            description: None,
            system_prompt: None,
            max_iterations: 24,
        }
    }
}

/// Identifies the parked turn a `PendingApprovals` result belongs to.
/// Valid for exactly one `resume` or `abort`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunHandle {
    run_id: Uuid,
    session_id: String,
}

impl RunHandle {
    pub(crate) fn new(run_id: Uuid, session_id: impl Into<String>) -> Self {
        Self {
            run_id,
            session_id: session_id.into(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum RunResult {
    Final {
        text: String,
    },
    PendingApprovals {
        requests: Vec<ToolInvocationRequest>,
        handle: RunHandle,
    },
}

impl RunResult {
    pub fn final_text(&self) -> Option<&str> {
        match self {
            RunResult::Final { text } => Some(text),
            RunResult::PendingApprovals { .. } => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, RunResult::PendingApprovals { .. })
    }
}

/// What a run middleware chain is asked to do.
#[derive(Clone, Debug, PartialEq)]
pub enum TurnRequest {
    Input(ModelMessage),
    Resume {
        decisions: Vec<ApprovalDecision>,
        handle: RunHandle,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Thinking {
        content: String,
    },
    Text {
        content: String,
    },
    ToolCall {
        tool: String,
        args_json: Value,
        tool_call_id: String,
    },
    ToolResult {
        tool: String,
        result_text: String,
        tool_call_id: String,
        is_error: bool,
    },
    ApprovalRequired {
        requests: Vec<ToolInvocationRequest>,
        handle: RunHandle,
    },
    FinalResponse {
        content: String,
    },
}

pub(crate) type EventSink = mpsc::UnboundedSender<AgentEvent>;

pub struct AgentBuilder {
    model: Option<Arc<dyn ChatModel>>,
    tools: Vec<ToolSpec>,
    config: AgentConfig,
    dependencies: DependencyMap,
    dependency_overrides: DependencyMap,
    run_middleware: Vec<Arc<dyn RunMiddleware>>,
    tool_middleware: Vec<Arc<dyn ToolMiddleware>>,
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self {
            model: None,
            tools: Vec::new(),
            config: AgentConfig::default(),
            dependencies: DependencyMap::new(),
            dependency_overrides: DependencyMap::new(),
            run_middleware: Vec::new(),
            tool_middleware: Vec::new(),
        }
    }
}

impl AgentBuilder {
    pub fn model<M>(mut self, model: M) -> Self
    where
        M: ChatModel + 'static,
    {
        self.model = Some(Arc::new(model));
        self
    }

    /// Uses a backend that is shared with other agents.
    pub fn shared_model(mut self, model: Arc<dyn ChatModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn tool(mut self, tool: ToolSpec) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools.extend(tools);
        self
    }

    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.config.description = Some(description.into());
        self
    }

    pub fn system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn max_iterations(mut self, max_iterations: u32) -> Self {
        self.config.max_iterations = max_iterations;
        self
    }

    pub fn dependency<T>(self, value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        self.dependencies.insert(value);
        self
    }

    pub fn dependency_named<T>(self, key: impl Into<String>, value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        self.dependencies.insert_named(key, value);
        self
    }

    pub fn dependency_override<T>(self, value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        self.dependency_overrides.insert(value);
        self
    }

    pub fn dependency_override_named<T>(self, key: impl Into<String>, value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        self.dependency_overrides.insert_named(key, value);
        self
    }

    pub fn middleware<M>(mut self, middleware: M) -> Self
    where
        M: RunMiddleware + 'static,
    {
        self.run_middleware.push(Arc::new(middleware));
        self
    }

    pub fn tool_middleware<M>(mut self, middleware: M) -> Self
    where
        M: ToolMiddleware + 'static,
    {
        self.tool_middleware.push(Arc::new(middleware));
        self
    }

    pub fn build(self) -> Result<Agent, AgentError> {
        let Some(model) = self.model else {
            return Err(AgentError::Config(
                "agent model must be configured via AgentBuilder::model(...)".to_string(),
            ));
        };

        if self.config.max_iterations == 0 {
            return Err(AgentError::Config(
                "max_iterations must be at least 1".to_string(),
            ));
        }

        let mut tools = ToolRegistry::new();
        for tool in self.tools {
            tools.register(tool)?;
        }
        let definitions = tools.definitions();

        Ok(Agent {
            inner: Arc::new(AgentInner {
                model,
                definitions,
                tools,
                config: self.config,
                dependencies: self.dependencies.merged_with(&self.dependency_overrides),
                run_middleware: self.run_middleware,
                tool_middleware: self.tool_middleware,
            }),
        })
    }
}

pub(crate) struct AgentInner {
    pub(crate) model: Arc<dyn ChatModel>,
    pub(crate) tools: ToolRegistry,
    pub(crate) definitions: Vec<ModelToolDefinition>,
    pub(crate) config: AgentConfig,
    pub(crate) dependencies: DependencyMap,
    pub(crate) run_middleware: Vec<Arc<dyn RunMiddleware>>,
    pub(crate) tool_middleware: Vec<Arc<dyn ToolMiddleware>>,
}

/// Cheap to clone; clones share tools, backend and middleware.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.inner.config.name)
            .field("tools", &self.inner.tools.len())
            .field("run_middleware", &self.inner.run_middleware.len())
            .field("tool_middleware", &self.inner.tool_middleware.len())
            .finish()
    }
}

enum StreamStep {
    Event(Option<AgentEvent>),
    Done(Result<RunResult, AgentError>),
}

impl Agent {
    pub fn builder() -> AgentBuilder {
        AgentBuilder::default()
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.config.name.as_deref()
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.inner.tools
    }

    /// Appends `input` to the session and drives the turn until the backend
    /// answers or a sensitive tool call needs approval.
    pub async fn run(
        &self,
        session: &mut Session,
        input: impl Into<ModelMessage>,
    ) -> Result<RunResult, AgentError> {
        let request = TurnRequest::Input(input.into());
        self.inner.dispatch(session, request, None).await
    }

    /// Continues a parked turn. `decisions` must cover exactly the pending
    /// call ids of `handle`'s turn.
    pub async fn resume(
        &self,
        session: &mut Session,
        decisions: Vec<ApprovalDecision>,
        handle: RunHandle,
    ) -> Result<RunResult, AgentError> {
        let request = TurnRequest::Resume { decisions, handle };
        self.inner.dispatch(session, request, None).await
    }

    /// Abandons a parked turn: unexecuted calls are recorded as cancelled and
    /// the backend continuation is released.
    pub async fn abort(&self, session: &mut Session, handle: RunHandle) -> Result<(), AgentError> {
        self.inner.abort_turn(session, handle).await
    }

    /// Runs a turn to completion, asking `gate` whenever approvals are needed.
    pub async fn run_with_gate(
        &self,
        session: &mut Session,
        input: impl Into<ModelMessage>,
        gate: &dyn ApprovalGate,
    ) -> Result<String, AgentError> {
        let mut result = self.run(session, input).await?;

        loop {
            let (requests, handle) = match result {
                RunResult::Final { text } => return Ok(text),
                RunResult::PendingApprovals { requests, handle } => (requests, handle),
            };

            let decisions = match collect_decisions(gate, &requests).await {
                Ok(decisions) => decisions,
                Err(err) => {
                    if let Err(abort_err) = self.abort(session, handle).await {
                        warn!(error = %abort_err, "failed to abort turn after gate error");
                    }
                    return Err(err);
                }
            };

            result = self.resume(session, decisions, handle).await?;
        }
    }

    pub fn run_stream<'a>(
        &'a self,
        session: &'a mut Session,
        input: ModelMessage,
    ) -> impl Stream<Item = Result<AgentEvent, AgentError>> + 'a {
        self.stream_turn(session, TurnRequest::Input(input))
    }

    pub fn resume_stream<'a>(
        &'a self,
        session: &'a mut Session,
        decisions: Vec<ApprovalDecision>,
        handle: RunHandle,
    ) -> impl Stream<Item = Result<AgentEvent, AgentError>> + 'a {
        self.stream_turn(session, TurnRequest::Resume { decisions, handle })
    }

    fn stream_turn<'a>(
        &'a self,
        session: &'a mut Session,
        request: TurnRequest,
    ) -> impl Stream<Item = Result<AgentEvent, AgentError>> + 'a {
        try_stream! {
            let (sender, mut receiver) = mpsc::unbounded_channel();
            let turn = self.inner.dispatch(session, request, Some(sender));
            futures_util::pin_mut!(turn);

            let outcome = loop {
                let step = tokio::select! {
                    biased;
                    event = receiver.recv() => StreamStep::Event(event),
                    outcome = turn.as_mut() => StreamStep::Done(outcome),
                };
                match step {
                    StreamStep::Event(Some(event)) => yield event,
                    StreamStep::Event(None) => break turn.as_mut().await,
                    StreamStep::Done(outcome) => break outcome,
                }
            };

            while let Ok(event) = receiver.try_recv() {
                yield event;
            }

            outcome?;
        }
    }

    /// Exposes this agent as a tool taking one string argument. Every call
    /// runs the agent on a fresh session.
    pub fn as_tool(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        arg_name: impl Into<String>,
        arg_description: impl Into<String>,
    ) -> ToolSpec {
        let arg_name = arg_name.into();
        let mut properties = serde_json::Map::new();
        properties.insert(
            arg_name.clone(),
            json!({"type": "string", "description": arg_description.into()}),
        );
        let schema = json!({
            "type": "object",
            "properties": properties,
            "required": [arg_name.clone()],
            "additionalProperties": false
        });
        let agent = self.clone();

        ToolSpec::new(name, description)
            .with_schema(schema)
            .expect("agent tool schema is valid")
            .with_handler(move |args, _deps| {
                let agent = agent.clone();
                let query = args
                    .get(&arg_name)
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let arg_name = arg_name.clone();
                async move {
                    let query = query.ok_or_else(|| ToolError::InvalidArguments {
                        tool: agent.name().unwrap_or("agent").to_string(),
                        message: format!("missing string field: {arg_name}"),
                    })?;
                    agent.answer_as_tool(query).await
                }
            })
    }

    /// [`Agent::as_tool`] with the agent's own name and description and a
    /// `task` argument.
    pub fn as_default_tool(&self) -> ToolSpec {
        let name = self.name().unwrap_or("agent").to_string();
        let description = self
            .inner
            .config
            .description
            .clone()
            .unwrap_or_else(|| format!("Delegate a task to {name}"));
        self.as_tool(name, description, "task", "The task for the agent to perform")
    }

    async fn answer_as_tool(&self, query: String) -> Result<ToolOutput, ToolError> {
        let mut session = Session::with_generated_id();
        match self.run(&mut session, query).await {
            Ok(RunResult::Final { text }) => Ok(ToolOutput::Text(text)),
            Ok(RunResult::PendingApprovals { handle, .. }) => {
                if let Err(err) = self.abort(&mut session, handle).await {
                    warn!(error = %err, "failed to abort nested agent turn");
                }
                Err(ToolError::Execution(
                    "the delegated agent asked for approval, which cannot be granted through a tool call"
                        .to_string(),
                ))
            }
            Err(err) => Err(ToolError::Execution(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests;
