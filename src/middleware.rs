//! Interceptors around whole runs and around single tool invocations.
//!
//! Middleware runs in registration order: the first registered middleware
//! sees the call first and the result last. Each middleware receives the
//! rest of the chain as a [`RunNext`] / [`ToolNext`] value; calling `run`
//! consumes it, and not calling it short-circuits everything behind it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use crate::agent::{AgentInner, EventSink, RunResult, TurnRequest};
use crate::error::{AgentError, ToolError};
use crate::llm::ModelToolCall;
use crate::session::Session;
use crate::tools::{DependencyMap, ToolExecution, ToolRegistry};

pub struct RunContext<'s> {
    pub session: &'s mut Session,
    pub agent_name: Option<String>,
    pub request: TurnRequest,
    /// Filled by the engine, or by a middleware that answers on its own.
    pub result: Option<RunResult>,
    pub metadata: HashMap<String, Value>,
    pub(crate) events: Option<EventSink>,
}

impl<'s> RunContext<'s> {
    pub(crate) fn new(
        session: &'s mut Session,
        request: TurnRequest,
        agent_name: Option<String>,
        events: Option<EventSink>,
    ) -> Self {
        Self {
            session,
            agent_name,
            request,
            result: None,
            metadata: HashMap::new(),
            events,
        }
    }
}

#[async_trait]
pub trait RunMiddleware: Send + Sync {
    async fn handle(&self, ctx: &mut RunContext<'_>, next: RunNext<'_>) -> Result<(), AgentError>;
}

/// The remainder of the run chain, ending in the engine.
pub struct RunNext<'a> {
    chain: &'a [Arc<dyn RunMiddleware>],
    agent: &'a AgentInner,
}

impl<'a> RunNext<'a> {
    pub(crate) fn new(chain: &'a [Arc<dyn RunMiddleware>], agent: &'a AgentInner) -> Self {
        Self { chain, agent }
    }

    pub async fn run(self, ctx: &mut RunContext<'_>) -> Result<(), AgentError> {
        match self.chain.split_first() {
            Some((head, rest)) => {
                head.handle(ctx, RunNext::new(rest, self.agent)).await
            }
            None => {
                let result = self.agent.execute(ctx).await?;
                ctx.result = Some(result);
                Ok(())
            }
        }
    }
}

pub struct ToolInvocationContext {
    pub session_id: String,
    /// The call as the backend sent it; arguments may be rewritten.
    pub call: ModelToolCall,
    pub result: Option<ToolExecution>,
}

impl ToolInvocationContext {
    pub(crate) fn new(session_id: &str, call: ModelToolCall) -> Self {
        Self {
            session_id: session_id.to_string(),
            call,
            result: None,
        }
    }
}

#[async_trait]
pub trait ToolMiddleware: Send + Sync {
    async fn handle(
        &self,
        ctx: &mut ToolInvocationContext,
        next: ToolNext<'_>,
    ) -> Result<(), ToolError>;
}

/// The remainder of the tool chain, ending in the tool's handler.
pub struct ToolNext<'a> {
    chain: &'a [Arc<dyn ToolMiddleware>],
    tools: &'a ToolRegistry,
    dependencies: &'a DependencyMap,
}

impl<'a> ToolNext<'a> {
    pub(crate) fn new(
        chain: &'a [Arc<dyn ToolMiddleware>],
        tools: &'a ToolRegistry,
        dependencies: &'a DependencyMap,
    ) -> Self {
        Self {
            chain,
            tools,
            dependencies,
        }
    }

    pub async fn run(self, ctx: &mut ToolInvocationContext) -> Result<(), ToolError> {
        let Some((head, rest)) = self.chain.split_first() else {
            let tool = self.tools.get(&ctx.call.name)?;
            let execution = match tool
                .execute(ctx.call.arguments.clone(), self.dependencies)
                .await
            {
                Ok(output) => ToolExecution::success(output.render()),
                Err(err) => {
                    warn!(tool = %ctx.call.name, call_id = %ctx.call.id, error = %err, "tool call failed");
                    ToolExecution::failure(err.to_string())
                }
            };
            ctx.result = Some(execution);
            return Ok(());
        };

        head.handle(
            ctx,
            ToolNext::new(rest, self.tools, self.dependencies),
        )
        .await
    }
}

/// Logs the start and end of every run and every tool call.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingMiddleware;

#[async_trait]
impl RunMiddleware for LoggingMiddleware {
    async fn handle(&self, ctx: &mut RunContext<'_>, next: RunNext<'_>) -> Result<(), AgentError> {
        let agent = ctx.agent_name.clone().unwrap_or_else(|| "agent".to_string());
        let session_id = ctx.session.id().to_string();
        let kind = match &ctx.request {
            TurnRequest::Input(_) => "run",
            TurnRequest::Resume { .. } => "resume",
        };
        info!(%agent, %session_id, kind, "starting {agent}");

        let outcome = next.run(ctx).await;

        match (&outcome, &ctx.result) {
            (Ok(()), Some(RunResult::Final { .. })) => {
                info!(%agent, %session_id, "{agent} finished")
            }
            (Ok(()), Some(RunResult::PendingApprovals { requests, .. })) => {
                info!(%agent, %session_id, pending = requests.len(), "{agent} is waiting for approvals")
            }
            (Ok(()), None) => info!(%agent, %session_id, "{agent} produced no result"),
            (Err(err), _) => warn!(%agent, %session_id, error = %err, "{agent} failed"),
        }
        outcome
    }
}

#[async_trait]
impl ToolMiddleware for LoggingMiddleware {
    async fn handle(
        &self,
        ctx: &mut ToolInvocationContext,
        next: ToolNext<'_>,
    ) -> Result<(), ToolError> {
        info!(tool = %ctx.call.name, call_id = %ctx.call.id, "calling {}", ctx.call.name);
        next.run(ctx).await?;
        if let Some(result) = &ctx.result {
            info!(
                tool = %ctx.call.name,
                is_error = result.is_error,
                "result => {}",
                result.content
            );
        }
        Ok(())
    }
}
