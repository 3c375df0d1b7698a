//! Tool system for agent tool calling.
//!
//! Defines the `Tool` trait, the registry that arbitrates calls, and the
//! built-in tools. The registry exposes the catalog in two levels: names +
//! short descriptions go into the system prompt; the full schema is served
//! on demand through the built-in `get_tool_info` call.

pub mod file;
pub mod shell;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::protocol::{ToolCall, ToolDefinition};

/// Result of executing a tool. The content string is echoed to the model
/// verbatim inside a tool_result block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: message.into(),
            is_error: true,
        }
    }
}

/// Trait that all tools implement.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name (e.g. "run_shell").
    fn name(&self) -> &str;
    /// One-line description for the catalog.
    fn description(&self) -> &str;
    /// Expanded description served by `get_tool_info`. Defaults to the
    /// short one.
    fn long_description(&self) -> String {
        self.description().to_string()
    }
    /// JSON Schema for the input object.
    fn input_schema(&self) -> serde_json::Value;
    /// Execute with the arguments object passed verbatim from the model.
    async fn execute(&self, input: serde_json::Value) -> ToolResult;
}

/// Holds the available tools and arbitrates calls by name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Registry with the built-in tool set.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(shell::RunShellTool::default()));
        registry.register(Arc::new(file::ReadFileTool));
        registry.register(Arc::new(file::WriteFileTool));
        registry.register(Arc::new(file::ListDirectoryTool));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    /// Level-1 catalog: names and short descriptions for the system prompt.
    pub fn catalog_text(&self) -> String {
        if self.tools.is_empty() {
            return String::new();
        }
        let mut out = String::from(
            "\n\n## Tools\nCall get_tool_info for the full input schema of a tool.\n",
        );
        for tool in &self.tools {
            out.push_str(&format!("- {}: {}\n", tool.name(), tool.description()));
        }
        out
    }

    /// API-level tool definitions, including the get_tool_info shim.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect();
        if !defs.is_empty() {
            defs.push(ToolDefinition {
                name: "get_tool_info".to_string(),
                description: "Get the full description and input schema of a named tool"
                    .to_string(),
                input_schema: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "name": { "type": "string", "description": "Tool name" }
                    },
                    "required": ["name"]
                }),
            });
        }
        defs
    }

    /// Level-2 info for one tool.
    pub fn tool_info(&self, name: &str) -> Option<String> {
        self.get(name).map(|tool| {
            format!(
                "{}\n\n{}\n\nInput schema:\n{}",
                tool.name(),
                tool.long_description(),
                serde_json::to_string_pretty(&tool.input_schema()).unwrap_or_default()
            )
        })
    }

    /// Execute one call. Unknown names come back as an error tool result,
    /// never as an exception — the model gets to recover.
    pub async fn execute(&self, call: &ToolCall) -> ToolResult {
        if call.name == "get_tool_info" {
            let name = call.input.get("name").and_then(|v| v.as_str()).unwrap_or("");
            return match self.tool_info(name) {
                Some(info) => ToolResult::success(info),
                None => ToolResult::error(format!("unknown tool: {name}")),
            };
        }

        match self.get(&call.name) {
            Some(tool) => {
                debug!(tool = %call.name, "executing tool");
                tool.execute(call.input.clone()).await
            }
            None => ToolResult::error(format!("unknown tool: {}", call.name)),
        }
    }
}
