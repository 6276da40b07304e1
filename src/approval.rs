//! Approval gate protocol: pending tool invocations, decisions, and the
//! pluggable sources that produce those decisions.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AgentError;
use crate::llm::ModelToolCall;

/// A tool call the backend asked for that must be approved before it runs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocationRequest {
    pub call_id: String,
    pub tool: String,
    pub arguments: Value,
    pub requires_approval: bool,
}

impl ToolInvocationRequest {
    pub(crate) fn from_call(call: &ModelToolCall, requires_approval: bool) -> Self {
        Self {
            call_id: call.id.clone(),
            tool: call.name.clone(),
            arguments: call.arguments.clone(),
            requires_approval,
        }
    }

    pub fn respond(&self, approved: bool) -> ApprovalDecision {
        ApprovalDecision {
            call_id: self.call_id.clone(),
            approved,
        }
    }

    pub fn approve(&self) -> ApprovalDecision {
        self.respond(true)
    }

    pub fn deny(&self) -> ApprovalDecision {
        self.respond(false)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub call_id: String,
    pub approved: bool,
}

/// Source of yes/no decisions for pending tool calls.
///
/// Implementations return exactly one decision per request, in request order.
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn decide(
        &self,
        requests: &[ToolInvocationRequest],
    ) -> Result<Vec<ApprovalDecision>, AgentError>;
}

/// Decides every request with a synchronous rule.
pub struct PolicyGate<F> {
    rule: F,
}

impl<F> PolicyGate<F>
where
    F: Fn(&ToolInvocationRequest) -> bool + Send + Sync,
{
    pub fn new(rule: F) -> Self {
        Self { rule }
    }
}

#[async_trait]
impl<F> ApprovalGate for PolicyGate<F>
where
    F: Fn(&ToolInvocationRequest) -> bool + Send + Sync,
{
    async fn decide(
        &self,
        requests: &[ToolInvocationRequest],
    ) -> Result<Vec<ApprovalDecision>, AgentError> {
        Ok(requests
            .iter()
            .map(|request| request.respond((self.rule)(request)))
            .collect())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DenyAllGate;

#[async_trait]
impl ApprovalGate for DenyAllGate {
    async fn decide(
        &self,
        requests: &[ToolInvocationRequest],
    ) -> Result<Vec<ApprovalDecision>, AgentError> {
        Ok(requests.iter().map(ToolInvocationRequest::deny).collect())
    }
}

/// Asks `gate` for decisions and checks that it answered every request it was
/// given, in order, and nothing else.
pub async fn collect_decisions(
    gate: &dyn ApprovalGate,
    requests: &[ToolInvocationRequest],
) -> Result<Vec<ApprovalDecision>, AgentError> {
    let decisions = gate.decide(requests).await?;

    if decisions.len() != requests.len() {
        return Err(AgentError::Gate(format!(
            "expected {} decisions, gate returned {}",
            requests.len(),
            decisions.len()
        )));
    }

    for (request, decision) in requests.iter().zip(&decisions) {
        if request.call_id != decision.call_id {
            return Err(AgentError::Gate(format!(
                "decision for '{}' does not match pending call '{}'",
                decision.call_id, request.call_id
            )));
        }
    }

    Ok(decisions)
}

/// Maps each pending call id to its verdict, failing unless `decisions`
/// covers exactly the pending ids.
pub(crate) fn match_decisions(
    requests: &[ToolInvocationRequest],
    decisions: &[ApprovalDecision],
) -> Result<HashMap<String, bool>, AgentError> {
    let mut verdicts = HashMap::with_capacity(decisions.len());
    let mut unexpected = Vec::new();

    for decision in decisions {
        let known = requests
            .iter()
            .any(|request| request.call_id == decision.call_id);
        if !known || verdicts.contains_key(&decision.call_id) {
            unexpected.push(decision.call_id.clone());
            continue;
        }
        verdicts.insert(decision.call_id.clone(), decision.approved);
    }

    let missing = requests
        .iter()
        .filter(|request| !verdicts.contains_key(&request.call_id))
        .map(|request| request.call_id.clone())
        .collect::<Vec<_>>();

    if !missing.is_empty() || !unexpected.is_empty() {
        return Err(AgentError::IncompleteApprovalSet {
            missing,
            unexpected,
        });
    }

    Ok(verdicts)
}
