pub mod bank;
mod deps;
mod schema;
pub mod weather;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::error::{SchemaError, ToolError};
use crate::llm::ModelToolDefinition;

pub use deps::DependencyMap;

/// What a handler hands back to the engine.
#[derive(Clone, Debug, PartialEq)]
pub enum ToolOutput {
    Text(String),
    Json(Value),
}

impl ToolOutput {
    pub fn render(&self) -> String {
        match self {
            ToolOutput::Text(text) => text.clone(),
            ToolOutput::Json(value) => value.to_string(),
        }
    }
}

impl From<String> for ToolOutput {
    fn from(text: String) -> Self {
        ToolOutput::Text(text)
    }
}

impl From<&str> for ToolOutput {
    fn from(text: &str) -> Self {
        ToolOutput::Text(text.to_string())
    }
}

/// Rendered result of one tool call as it is recorded in history.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolExecution {
    pub content: String,
    pub is_error: bool,
}

impl ToolExecution {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn failure(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

type ToolHandler =
    dyn Fn(Value, &DependencyMap) -> BoxFuture<'static, Result<ToolOutput, ToolError>> + Send + Sync;

#[derive(Clone)]
pub struct ToolSpec {
    name: String,
    description: String,
    json_schema: Value,
    requires_approval: bool,
    handler: Arc<ToolHandler>,
}

impl std::fmt::Debug for ToolSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSpec")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("json_schema", &self.json_schema)
            .field("requires_approval", &self.requires_approval)
            .finish()
    }
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            json_schema: serde_json::json!({
                "type": "object",
                "properties": {},
                "required": [],
                "additionalProperties": true,
            }),
            requires_approval: false,
            handler: Arc::new(|_args, _deps| {
                Box::pin(async {
                    Err(ToolError::Execution(
                        "tool handler not configured".to_string(),
                    ))
                })
            }),
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Result<Self, SchemaError> {
        schema::validate_schema(&schema)?;
        self.json_schema = schema;
        Ok(self)
    }

    pub fn with_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Value, &DependencyMap) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolOutput, ToolError>> + Send + 'static,
    {
        self.handler = Arc::new(move |args, deps| Box::pin(handler(args, deps)));
        self
    }

    /// Marks the tool as sensitive: the engine parks its calls until an
    /// approval decision arrives.
    pub fn requires_approval(mut self, requires_approval: bool) -> Self {
        self.requires_approval = requires_approval;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn json_schema(&self) -> &Value {
        &self.json_schema
    }

    pub fn is_sensitive(&self) -> bool {
        self.requires_approval
    }

    pub fn definition(&self) -> ModelToolDefinition {
        ModelToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.json_schema.clone(),
        }
    }

    pub async fn execute(
        &self,
        args: Value,
        dependencies: &DependencyMap,
    ) -> Result<ToolOutput, ToolError> {
        schema::validate_arguments(self.name(), &self.json_schema, &args)?;
        (self.handler)(args, dependencies).await
    }
}

/// Tools known to an agent, in registration order.
#[derive(Clone, Debug, Default)]
pub struct ToolRegistry {
    tools: Vec<ToolSpec>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: ToolSpec) -> Result<(), ToolError> {
        if self.index.contains_key(tool.name()) {
            return Err(ToolError::DuplicateTool(tool.name().to_string()));
        }
        self.index.insert(tool.name().to_string(), self.tools.len());
        self.tools.push(tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&ToolSpec, ToolError> {
        self.index
            .get(name)
            .map(|&position| &self.tools[position])
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn definitions(&self) -> Vec<ModelToolDefinition> {
        self.tools.iter().map(ToolSpec::definition).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolSpec> {
        self.tools.iter()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
