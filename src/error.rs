use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("tool schema must be a JSON object")]
    SchemaNotObject,
    #[error("tool schema must declare type=object")]
    RootTypeMustBeObject,
    #[error("required must be an array of strings")]
    InvalidRequired,
    #[error("property '{0}' must be described by a JSON object")]
    InvalidProperty(String),
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("duplicate tool registered: {0}")]
    DuplicateTool(String),
    #[error("invalid tool arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },
    #[error("dependency missing: {0}")]
    MissingDependency(&'static str),
    #[error("tool execution failed: {0}")]
    Execution(String),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(String),
    #[error("provider response invalid: {0}")]
    Response(String),
}

#[derive(Debug, Error)]
pub enum AgentError {
    /// History is rolled back to the start of the turn, or, when tool outputs
    /// of the turn were already recorded, to the last batch followed by a
    /// `[turn failed: ...]` assistant note.
    #[error("backend requested unknown tool '{tool}'")]
    UnknownTool { tool: String },
    #[error(
        "approval decisions do not match the pending calls (missing: {missing:?}, unexpected: {unexpected:?})"
    )]
    IncompleteApprovalSet {
        missing: Vec<String>,
        unexpected: Vec<String>,
    },
    #[error("run handle {run_id} is stale or belongs to another session")]
    StaleRunHandle { run_id: Uuid },
    #[error("session '{session_id}' has unresolved approvals for run {run_id}")]
    ApprovalsOutstanding { session_id: String, run_id: Uuid },
    #[error("backend unavailable: {0}")]
    BackendUnavailable(#[from] ProviderError),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("max iterations reached ({max_iterations})")]
    MaxIterationsReached { max_iterations: u32 },
    #[error("run middleware completed without producing a result")]
    MissingRunResult,
    #[error("approval gate failed: {0}")]
    Gate(String),
    #[error("agent configuration error: {0}")]
    Config(String),
}
