//! Tool trait: the abstraction over agent capabilities.
//!
//! Tools are what give the agent the ability to act in the world. The
//! registry contents are supplied by the embedding application; this module
//! only defines the lookup/execute contract the orchestration loop needs.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::ToolError;
use crate::model::ToolDeclaration;
use crate::turn::ToolResult;

/// The core Tool trait.
///
/// Each tool implements this trait and is registered in the [`ToolRegistry`],
/// which the iteration loop consults when the model requests execution.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g. "web_search", "file_read").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the model).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool. The call id is threaded through so the result can
    /// be matched back to the request that produced it.
    async fn execute(
        &self,
        call_id: &str,
        arguments: serde_json::Value,
    ) -> std::result::Result<ToolResult, ToolError>;

    /// Convert this tool into a declaration for the model call.
    fn to_declaration(&self) -> ToolDeclaration {
        ToolDeclaration {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// A registry of available tools.
///
/// The iteration loop uses this to:
/// 1. Get tool declarations to send to the model
/// 2. Look up tools when the model requests them
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    /// Get all tool declarations (for sending to the model).
    pub fn declarations(&self) -> Vec<ToolDeclaration> {
        self.tools.values().map(|t| t.to_declaration()).collect()
    }

    /// List all registered tool names.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
