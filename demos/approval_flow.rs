use std::collections::VecDeque;
use std::error::Error;
use std::sync::Mutex;

use agent_gate_rs::tools::bank::{Ledger, bank_tools};
use agent_gate_rs::{
    Agent, ChatModel, ModelCompletion, ModelRequest, ModelToolCall, ProviderError, RunResult,
    Session, ToolInvocationRequest,
};
use async_trait::async_trait;
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

fn call(id: &str, name: &str, arguments: serde_json::Value) -> Result<ModelCompletion, ProviderError> {
    Ok(ModelCompletion {
        tool_calls: vec![ModelToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
        }],
        ..ModelCompletion::default()
    })
}

fn text(content: &str) -> Result<ModelCompletion, ProviderError> {
    Ok(ModelCompletion {
        text: Some(content.to_string()),
        ..ModelCompletion::default()
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let model = ScriptedModel::new(vec![
        call("call_balance", "get_account_balance", json!({})),
        text("Your balance is 1250.00 USD."),
        call(
            "call_pay",
            "submit_payment",
            json!({"amount": 50, "recipient": "Alice", "reference": "INV1"}),
        ),
        text("I sent 50.00 USD to Alice with reference INV1."),
    ]);

    let agent = Agent::builder()
        .model(model)
        .name("FinanceAgent")
        .system_prompt("You are an agent from Contoso Bank.")
        .tools(bank_tools())
        .dependency(Ledger::new(1250.0, "USD"))
        .build()?;
    let mut session = Session::new("finance");

    let result = agent.run(&mut session, "What's my balance?").await?;
    println!("balance turn: {result:?}");

    let result = agent
        .run(&mut session, "Transfer $50 to Alice, ref INV1")
        .await?;
    let RunResult::PendingApprovals { requests, handle } = result else {
        return Err("expected the transfer to wait for approval".into());
    };

    for request in &requests {
        println!("approval needed: {} {}", request.tool, request.arguments);
    }
    println!(
        "handle: {}",
        serde_json::to_string(&handle).unwrap_or_default()
    );

    let decisions = requests.iter().map(ToolInvocationRequest::approve).collect();
    let result = agent.resume(&mut session, decisions, handle).await?;
    println!("transfer turn: {result:?}");
    println!("history length: {}", session.len());

    Ok(())
}
