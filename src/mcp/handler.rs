//! Tool registration and execution.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::mcp::protocol::{ContentBlock, Tool, ToolResult};
use crate::mcp::router::Workspace;

/// JSON object arguments passed to a tool.
pub type Arguments = Map<String, Value>;

/// Handler for MCP tool calls.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Run the tool against `workspace`, returning a tool result object.
    async fn invoke(&self, workspace: &Workspace, arguments: Arguments) -> Result<Value>;
}

/// A named tool with its public contract and handler.
#[derive(Clone)]
pub struct ToolRegistration {
    pub id: String,
    pub title: String,
    pub description: String,
    pub input_schema: Value,
    pub handler: Arc<dyn ToolHandler>,
}

impl ToolRegistration {
    /// Validate and build a registration.
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<Self> {
        let registration = Self {
            id: id.into(),
            title: title.into(),
            description: description.into(),
            input_schema,
            handler,
        };

        if registration.id.trim().is_empty() {
            return Err(Error::InvalidToolRegistration("Tool id must not be blank".into()));
        }
        if registration.title.trim().is_empty() {
            return Err(Error::InvalidToolRegistration("Tool title must not be blank".into()));
        }
        if registration.description.trim().is_empty() {
            return Err(Error::InvalidToolRegistration(
                "Tool description must not be blank".into(),
            ));
        }
        if registration.input_schema.get("type").and_then(Value::as_str) != Some("object") {
            return Err(Error::InvalidToolRegistration(
                "Tool inputSchema.type must be object".into(),
            ));
        }

        Ok(registration)
    }

    /// The listed form of this tool.
    pub fn definition(&self) -> Tool {
        Tool {
            name: self.id.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
        }
    }

    fn same_contract(&self, other: &ToolRegistration) -> bool {
        self.id == other.id
            && self.title == other.title
            && self.description == other.description
            && self.input_schema == other.input_schema
    }
}

impl fmt::Debug for ToolRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistration")
            .field("id", &self.id)
            .field("title", &self.title)
            .finish_non_exhaustive()
    }
}

/// Catalog of available tools.
pub trait ToolRegistry: Send + Sync {
    /// All tools, sorted by id.
    fn list_tools(&self) -> Vec<ToolRegistration>;

    fn find_tool(&self, tool_id: &str) -> Option<ToolRegistration>;

    /// Add a tool. Re-registering the same contract is a no-op; a different
    /// contract under an existing id is rejected.
    fn register_tool(&self, tool: ToolRegistration) -> Result<()>;
}

/// Runs a named tool against a workspace.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, workspace: &Workspace, tool_id: &str, arguments: Arguments) -> Result<Value>;
}

/// Concurrent in-memory tool registry.
#[derive(Default)]
pub struct InMemoryToolRegistry {
    tools: DashMap<String, ToolRegistration>,
}

impl InMemoryToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of registered tools.
    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }
}

impl ToolRegistry for InMemoryToolRegistry {
    fn list_tools(&self) -> Vec<ToolRegistration> {
        let mut tools: Vec<ToolRegistration> = self.tools.iter().map(|e| e.value().clone()).collect();
        tools.sort_by(|a, b| a.id.cmp(&b.id));
        tools
    }

    fn find_tool(&self, tool_id: &str) -> Option<ToolRegistration> {
        self.tools.get(tool_id).map(|e| e.value().clone())
    }

    fn register_tool(&self, tool: ToolRegistration) -> Result<()> {
        match self.tools.entry(tool.id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(tool);
                Ok(())
            }
            Entry::Occupied(existing) => {
                if existing.get().same_contract(&tool) {
                    Ok(())
                } else {
                    Err(Error::ToolContractMismatch(tool.id))
                }
            }
        }
    }
}

/// Executor that dispatches through a [`ToolRegistry`].
pub struct DefaultToolExecutor {
    registry: Arc<dyn ToolRegistry>,
}

impl DefaultToolExecutor {
    pub fn new(registry: Arc<dyn ToolRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ToolExecutor for DefaultToolExecutor {
    async fn execute(&self, workspace: &Workspace, tool_id: &str, arguments: Arguments) -> Result<Value> {
        match self.registry.find_tool(tool_id) {
            Some(tool) => tool.handler.invoke(workspace, arguments).await,
            None => error_result(format!("Unknown tool: {}", tool_id)),
        }
    }
}

/// Helper to create a text content block.
pub fn text_content(text: impl Into<String>) -> ContentBlock {
    ContentBlock::Text { text: text.into() }
}

/// Helper to create a successful tool result with structured content.
pub fn structured_result(text: impl Into<String>, structured: Value) -> Result<Value> {
    Ok(serde_json::to_value(ToolResult {
        content: vec![text_content(text)],
        structured_content: Some(structured),
        is_error: false,
    })?)
}

/// Helper to create an error tool result.
pub fn error_result(text: impl Into<String>) -> Result<Value> {
    Ok(serde_json::to_value(ToolResult {
        content: vec![text_content(text)],
        structured_content: None,
        is_error: true,
    })?)
}

/// Helper to extract a required string argument.
pub fn get_string_arg(args: &Arguments, name: &str) -> Result<String> {
    args.get(name)
        .and_then(|v| v.as_str())
        .map(String::from)
        .ok_or_else(|| Error::InvalidToolArguments(format!("Missing required argument: {}", name)))
}

/// Helper to extract an optional integer argument.
pub fn get_optional_int_arg(args: &Arguments, name: &str) -> Option<i64> {
    args.get(name).and_then(|v| v.as_i64())
}

/// Helper to extract a boolean argument. Accepts `true` or `"true"`.
pub fn get_bool_arg(args: &Arguments, name: &str, default: bool) -> bool {
    match args.get(name) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s == "true",
        _ => default,
    }
}
