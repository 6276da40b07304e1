use anthropic_ai_sdk::client::AnthropicClient;
use anthropic_ai_sdk::types::message::{
    ContentBlock, CreateMessageParams, CreateMessageResponse, Message, MessageClient, MessageError,
    RequiredMessageParams, Role as AnthropicRole, Thinking, ThinkingType, Tool, ToolChoice,
};
use async_trait::async_trait;
use tracing::debug;

use crate::error::ProviderError;
use crate::llm::{
    ChatModel, ContentPart, ModelCompletion, ModelMessage, ModelRequest, ModelToolCall,
    ModelToolChoice, ModelUsage, Role,
};

const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Clone)]
/// Runtime configuration for [`AnthropicModel`].
pub struct AnthropicModelConfig {
    /// Anthropic API key.
    pub api_key: String,
    /// Model id (for example `claude-sonnet-4-5`).
    pub model: String,
    /// Anthropic API version header value.
    pub api_version: String,
    /// Optional base URL override for proxies or compatible endpoints.
    pub api_base_url: Option<String>,
    /// Maximum output tokens per call.
    pub max_tokens: u32,
    /// Optional sampling temperature.
    pub temperature: Option<f32>,
    /// Optional budget for extended thinking tokens.
    pub thinking_budget_tokens: Option<usize>,
}

impl AnthropicModelConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            api_version: AnthropicClient::DEFAULT_API_VERSION.to_string(),
            api_base_url: None,
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: None,
            thinking_budget_tokens: None,
        }
    }

    /// Reads `ANTHROPIC_API_KEY` and the optional `ANTHROPIC_BASE_URL`.
    pub fn from_env(model: impl Into<String>) -> Result<Self, ProviderError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| ProviderError::Request("ANTHROPIC_API_KEY is not set".to_string()))?;
        let mut config = Self::new(api_key, model);
        config.api_base_url = std::env::var("ANTHROPIC_BASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());
        Ok(config)
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = Some(url.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

#[derive(Debug, Clone)]
/// Backend connector for the Anthropic Messages API.
pub struct AnthropicModel {
    client: AnthropicClient,
    config: AnthropicModelConfig,
}

impl AnthropicModel {
    pub fn new(config: AnthropicModelConfig) -> Result<Self, ProviderError> {
        let mut builder =
            AnthropicClient::builder(config.api_key.clone(), config.api_version.clone());
        if let Some(url) = &config.api_base_url {
            builder = builder.with_api_base_url(url.clone());
        }

        let client = builder
            .build::<MessageError>()
            .map_err(|err| ProviderError::Request(err.to_string()))?;

        Ok(Self { client, config })
    }

    pub fn from_env(model: impl Into<String>) -> Result<Self, ProviderError> {
        Self::new(AnthropicModelConfig::from_env(model)?)
    }

    pub fn model_name(&self) -> &str {
        &self.config.model
    }
}

#[async_trait]
impl ChatModel for AnthropicModel {
    async fn invoke(&self, request: ModelRequest<'_>) -> Result<ModelCompletion, ProviderError> {
        let (history, system) = to_anthropic_messages(request.messages);

        let required = RequiredMessageParams {
            model: self.config.model.clone(),
            messages: history,
            max_tokens: self.config.max_tokens,
        };

        let mut params = CreateMessageParams::new(required).with_stream(false);

        if let Some(system_prompt) = system {
            params = params.with_system(system_prompt);
        }

        if let Some(temperature) = self.config.temperature {
            params = params.with_temperature(temperature);
        }

        if let Some(budget_tokens) = self.config.thinking_budget_tokens {
            params = params.with_thinking(Thinking {
                budget_tokens,
                type_: ThinkingType::Enabled,
            });
        }

        if !request.tools.is_empty() {
            let tools = request
                .tools
                .iter()
                .map(|tool| Tool {
                    name: tool.name.clone(),
                    description: Some(tool.description.clone()),
                    input_schema: tool.parameters.clone(),
                })
                .collect::<Vec<_>>();

            params = params.with_tools(tools);
            params = params.with_tool_choice(match request.tool_choice {
                ModelToolChoice::Auto => ToolChoice::Auto,
                ModelToolChoice::Required => ToolChoice::Any,
                ModelToolChoice::None => ToolChoice::None,
                ModelToolChoice::Tool(name) => ToolChoice::Tool { name },
            });
        }

        debug!(
            model = %self.config.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "sending anthropic request"
        );

        let response = self
            .client
            .create_message(Some(&params))
            .await
            .map_err(|err| ProviderError::Request(err.to_string()))?;

        Ok(normalize_response(&response))
    }
}

fn to_anthropic_messages(messages: &[ModelMessage]) -> (Vec<Message>, Option<String>) {
    let mut system_lines = Vec::new();
    let mut anthropic_messages = Vec::new();

    for message in messages {
        if message.role == Role::System {
            let text = message.text();
            if !text.is_empty() {
                system_lines.push(text);
            }
            continue;
        }

        let blocks = message
            .content
            .iter()
            .filter_map(|part| to_content_block(message.role, part))
            .collect::<Vec<_>>();

        // approval-only messages carry nothing the API understands
        if blocks.is_empty() {
            continue;
        }

        let role = match message.role {
            Role::Assistant => AnthropicRole::Assistant,
            Role::User | Role::System => AnthropicRole::User,
        };
        anthropic_messages.push(Message::new_blocks(role, blocks));
    }

    let system = if system_lines.is_empty() {
        None
    } else {
        Some(system_lines.join("\n\n"))
    };

    (anthropic_messages, system)
}

fn to_content_block(role: Role, part: &ContentPart) -> Option<ContentBlock> {
    match (role, part) {
        (_, ContentPart::Text { text }) if !text.is_empty() => {
            Some(ContentBlock::Text { text: text.clone() })
        }
        (Role::User, ContentPart::Uri { uri, media_type }) => Some(ContentBlock::Text {
            text: format!("[attachment {media_type}: {uri}]"),
        }),
        (Role::Assistant, ContentPart::ToolCall(call)) => Some(ContentBlock::ToolUse {
            id: call.id.clone(),
            name: call.name.clone(),
            input: call.arguments.clone(),
        }),
        (
            Role::User,
            ContentPart::ToolResult {
                tool_call_id,
                content,
                is_error,
                ..
            },
        ) => {
            let rendered = if *is_error {
                format!("Error: {content}")
            } else {
                content.clone()
            };
            Some(ContentBlock::ToolResult {
                tool_use_id: tool_call_id.clone(),
                content: rendered,
            })
        }
        _ => None,
    }
}

fn normalize_response(response: &CreateMessageResponse) -> ModelCompletion {
    let mut text_parts = Vec::new();
    let mut thinking_parts = Vec::new();
    let mut tool_calls = Vec::new();

    for block in &response.content {
        match block {
            ContentBlock::Text { text } => text_parts.push(text.clone()),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(ModelToolCall {
                id: id.clone(),
                name: name.clone(),
                arguments: input.clone(),
            }),
            ContentBlock::Thinking { thinking, .. } => thinking_parts.push(thinking.clone()),
            ContentBlock::RedactedThinking { data } => {
                thinking_parts.push(format!("[redacted:{} bytes]", data.len()))
            }
            _ => {}
        }
    }

    ModelCompletion {
        text: (!text_parts.is_empty()).then(|| text_parts.join("\n")),
        thinking: (!thinking_parts.is_empty()).then(|| thinking_parts.join("\n")),
        tool_calls,
        usage: Some(ModelUsage {
            input_tokens: response.usage.input_tokens,
            output_tokens: response.usage.output_tokens,
        }),
        continuation: None,
    }
}
