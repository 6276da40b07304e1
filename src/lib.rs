//! Agent runtime with human approval of sensitive tool calls.
//!
//! Surface:
//! - `Agent::run` / `Agent::resume` / `Agent::abort` over an explicit `Session`,
//!   returning `RunResult::Final` or `RunResult::PendingApprovals`
//! - `ApprovalGate` implementations and the `run_with_gate` driver
//! - Run and tool middleware chains
//! - Tool registry with JSON schema validation and dependency injection
//! - Anthropic adapter via `AnthropicModel`

pub mod agent;
pub mod approval;
pub mod error;
pub mod llm;
pub mod middleware;
pub mod session;
pub mod tools;

pub use agent::{Agent, AgentBuilder, AgentConfig, AgentEvent, RunHandle, RunResult, TurnRequest};
pub use approval::{
    ApprovalDecision, ApprovalGate, DenyAllGate, PolicyGate, ToolInvocationRequest,
    collect_decisions,
};
pub use error::{AgentError, ProviderError, SchemaError, ToolError};
pub use llm::{
    AnthropicModel, AnthropicModelConfig, ChatModel, ContentPart, ModelCompletion, ModelMessage,
    ModelRequest, ModelToolCall, ModelToolChoice, ModelToolDefinition, ModelUsage, Role,
};
pub use middleware::{
    LoggingMiddleware, RunContext, RunMiddleware, RunNext, ToolInvocationContext, ToolMiddleware,
    ToolNext,
};
pub use session::{Session, SessionStore, SharedSession};
pub use tools::{DependencyMap, ToolExecution, ToolOutput, ToolRegistry, ToolSpec};
