use std::collections::VecDeque;
use std::error::Error;
use std::sync::Mutex;

use agent_gate_rs::tools::weather::time_tool;
use agent_gate_rs::{
    Agent, AgentError, AgentEvent, ChatModel, LoggingMiddleware, ModelCompletion, ModelMessage,
    ModelRequest, ModelToolCall, ProviderError, RunContext, RunMiddleware, RunNext, Session,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::json;

#[derive(Default)]
struct ScriptedModel {
    responses: Mutex<VecDeque<Result<ModelCompletion, ProviderError>>>,
}

impl ScriptedModel {
    fn new(responses: Vec<Result<ModelCompletion, ProviderError>>) -> Self {
        Self {
            responses: Mutex::new(VecDeque::from(responses)),
        }
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn invoke(&self, _request: ModelRequest<'_>) -> Result<ModelCompletion, ProviderError> {
        let mut guard = self.responses.lock().expect("lock poisoned");
        guard.pop_front().unwrap_or_else(|| {
            Err(ProviderError::Response(
                "scripted model exhausted responses".to_string(),
            ))
        })
    }
}

/// Prints around the whole run, like a hand-written agent middleware.
struct Banner;

#[async_trait]
impl RunMiddleware for Banner {
    async fn handle(&self, ctx: &mut RunContext<'_>, next: RunNext<'_>) -> Result<(), AgentError> {
        let name = ctx.agent_name.clone().unwrap_or_default();
        println!("FROM MIDDLEWARE (Agent): Starting {name}...");
        next.run(ctx).await?;
        println!("FROM MIDDLEWARE (Agent): {name} finished!");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("info"))
        .init();

    let model = ScriptedModel::new(vec![
        Ok(ModelCompletion {
            tool_calls: vec![ModelToolCall {
                id: "call_time".to_string(),
                name: "get_time".to_string(),
                arguments: json!({}),
            }],
            ..ModelCompletion::default()
        }),
        Ok(ModelCompletion {
            text: Some("Hi there! I just checked the clock for you.".to_string()),
            ..ModelCompletion::default()
        }),
    ]);

    let agent = Agent::builder()
        .model(model)
        .name("GreetingAgent")
        .system_prompt("You are a friendly greeting assistant.")
        .tool(time_tool())
        .middleware(Banner)
        .middleware(LoggingMiddleware)
        .tool_middleware(LoggingMiddleware)
        .build()?;
    let mut session = Session::new("greeting");

    let stream = agent.run_stream(
        &mut session,
        ModelMessage::user("Hi there! What time is it right now?"),
    );
    futures_util::pin_mut!(stream);

    while let Some(event) = stream.next().await {
        match event? {
            AgentEvent::ToolCall { tool, args_json, .. } => println!("tool-call {tool}: {args_json}"),
            AgentEvent::ToolResult {
                tool, result_text, ..
            } => println!("tool-result {tool}: {result_text}"),
            AgentEvent::FinalResponse { content } => println!("\nfinal:\n{content}"),
            AgentEvent::Thinking { .. }
            | AgentEvent::Text { .. }
            | AgentEvent::ApprovalRequired { .. } => {}
        }
    }

    Ok(())
}
