mod anthropic;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::approval::ApprovalDecision;
use crate::error::ProviderError;

pub use anthropic::{AnthropicModel, AnthropicModelConfig};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One piece of a message. Tool results and approval responses travel in
/// user messages, tool calls in assistant messages.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Uri {
        uri: String,
        media_type: String,
    },
    ToolCall(ModelToolCall),
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        content: String,
        is_error: bool,
    },
    ApprovalResponse {
        tool_call_id: String,
        approved: bool,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelMessage {
    pub role: Role,
    pub content: Vec<ContentPart>,
}

impl ModelMessage {
    pub fn new(role: Role, content: Vec<ContentPart>) -> Self {
        Self { role, content }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![ContentPart::Text { text: text.into() }])
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentPart::Text { text: text.into() }])
    }

    pub fn assistant(text: Option<String>, tool_calls: Vec<ModelToolCall>) -> Self {
        let mut content = Vec::with_capacity(tool_calls.len() + 1);
        if let Some(text) = text.filter(|text| !text.is_empty()) {
            content.push(ContentPart::Text { text });
        }
        content.extend(tool_calls.into_iter().map(ContentPart::ToolCall));
        Self::new(Role::Assistant, content)
    }

    pub fn approval_responses(decisions: &[ApprovalDecision]) -> Self {
        let content = decisions
            .iter()
            .map(|decision| ContentPart::ApprovalResponse {
                tool_call_id: decision.call_id.clone(),
                approved: decision.approved,
            })
            .collect();
        Self::new(Role::User, content)
    }

    /// Appends a part, e.g. an image reference next to a text prompt.
    pub fn with_part(mut self, part: ContentPart) -> Self {
        self.content.push(part);
        self
    }

    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &ModelToolCall> {
        self.content.iter().filter_map(|part| match part {
            ContentPart::ToolCall(call) => Some(call),
            _ => None,
        })
    }

    pub fn tool_results(&self) -> impl Iterator<Item = &ContentPart> {
        self.content
            .iter()
            .filter(|part| matches!(part, ContentPart::ToolResult { .. }))
    }
}

impl From<&str> for ModelMessage {
    fn from(text: &str) -> Self {
        Self::user(text)
    }
}

impl From<String> for ModelMessage {
    fn from(text: String) -> Self {
        Self::user(text)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModelToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModelToolChoice {
    Auto,
    Required,
    None,
    Tool(String),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModelCompletion {
    pub text: Option<String>,
    pub thinking: Option<String>,
    pub tool_calls: Vec<ModelToolCall>,
    pub usage: Option<ModelUsage>,
    /// Opaque token the backend wants back on the next round-trip.
    pub continuation: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModelUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Everything the backend sees for one round-trip.
#[derive(Clone, Debug)]
pub struct ModelRequest<'a> {
    pub messages: &'a [ModelMessage],
    pub tools: &'a [ModelToolDefinition],
    pub tool_choice: ModelToolChoice,
    pub continuation: Option<&'a str>,
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn invoke(&self, request: ModelRequest<'_>) -> Result<ModelCompletion, ProviderError>;

    /// Frees backend-held state for an abandoned turn.
    async fn release(&self, _continuation: &str) -> Result<(), ProviderError> {
        Ok(())
    }
}
