//! Tool system for AI agent tool calling.
//!
//! Defines the `Tool` trait that all tools implement, plus a registry
//! for managing available tools and converting them to LLM API format.

pub mod bash_session;
pub mod build;
pub mod execute_command;
pub mod knowledge;
pub mod link_identity;
pub mod list_files;
pub mod patch_file;
pub mod read_file;
pub mod reminder;
pub mod script_tool;
pub mod search_files;
pub mod send_message;
pub mod skill;
pub mod tool_loop;
pub mod write_file;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use neomagi_core::types::{RiskLevel, ToolGroup, ToolMode};

use crate::provider::ToolDefinition;

/// Result of executing a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Text content returned to the LLM.
    pub content: String,
    /// Whether the tool execution failed.
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

/// Trait that all tools must implement.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name for this tool (e.g. "read_file").
    fn name(&self) -> &str;
    /// Human-readable description of what this tool does.
    fn description(&self) -> &str;
    /// JSON Schema for the tool's input parameters.
    fn input_schema(&self) -> serde_json::Value;
    /// Execute the tool with the given input.
    async fn execute(&self, input: serde_json::Value) -> ToolResult;

    /// Domain classification. Guardrail gating never checks this — only
    /// `risk_level` — it exists for catalog/listing purposes.
    fn group(&self) -> ToolGroup {
        ToolGroup::Code
    }

    /// Modes in which this tool is available. Fail-closed: empty by
    /// default, meaning an undeclared tool is available in no mode.
    fn allowed_modes(&self) -> &'static [ToolMode] {
        &[]
    }

    /// Risk classification for guardrail gating. Fail-closed: high by
    /// default — read-only tools with no external side effects should
    /// override this to `Low`.
    fn risk_level(&self) -> RiskLevel {
        RiskLevel::High
    }
}

/// Registry for agent tools: lookup plus mode-aware filtering.
///
/// Mode overrides can only restrict a tool's declared `allowed_modes`,
/// never expand them.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
    mode_overrides: HashMap<String, Vec<ToolMode>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Returns an error if the name is already taken.
    pub fn register(&mut self, tool: Box<dyn Tool>) -> Result<(), String> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(format!("tool already registered: {name}"));
        }
        if tool.allowed_modes().is_empty() {
            warn!(
                tool_name = %name,
                "tool_registered_without_modes: empty allowed_modes (fail-closed), unavailable in any mode"
            );
        }
        info!(tool_name = %name, "tool_registered");
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    /// Restrict (never expand) a tool's effective modes.
    pub fn set_mode_override(&mut self, tool_name: &str, modes: Vec<ToolMode>) -> Result<(), String> {
        let tool = self.tools.get(tool_name).ok_or_else(|| format!("tool not registered: {tool_name}"))?;
        let allowed = tool.allowed_modes();
        if let Some(extra) = modes.iter().find(|m| !allowed.contains(m)) {
            return Err(format!(
                "cannot expand modes for '{tool_name}': {extra:?} not in allowed_modes {allowed:?}"
            ));
        }
        self.mode_overrides.insert(tool_name.to_string(), modes);
        Ok(())
    }

    fn effective_modes(&self, tool_name: &str) -> Vec<ToolMode> {
        let Some(tool) = self.tools.get(tool_name) else {
            return Vec::new();
        };
        match self.mode_overrides.get(tool_name) {
            Some(overrides) => tool.allowed_modes().iter().filter(|m| overrides.contains(m)).copied().collect(),
            None => tool.allowed_modes().to_vec(),
        }
    }

    /// False for unknown tools as well as tools not permitted in `mode`.
    pub fn check_mode(&self, tool_name: &str, mode: ToolMode) -> bool {
        self.effective_modes(tool_name).contains(&mode)
    }

    pub fn list_tools(&self, mode: ToolMode) -> Vec<&dyn Tool> {
        self.tools
            .values()
            .filter(|t| self.effective_modes(t.name()).contains(&mode))
            .map(|t| t.as_ref())
            .collect()
    }

    pub fn tools_schema(&self, mode: ToolMode) -> Vec<ToolDefinition> {
        self.list_tools(mode)
            .into_iter()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect()
    }
}

/// Static catalog of all built-in tools (name, description).
///
/// Does not require instantiation or context â€” useful for `/tools` listing.
pub fn tool_catalog() -> Vec<(&'static str, &'static str)> {
    vec![
        ("read_file", "Read the contents of a file"),
        ("write_file", "Write content to a file"),
        ("list_files", "List files in a directory"),
        ("search_files", "Search for text patterns in files"),
        ("patch_file", "Apply a patch to modify a file"),
        ("execute_command", "Execute a shell command (one-shot)"),
        ("bash", "Persistent interactive bash session"),
        ("knowledge_search", "Search the knowledge base (FTS5)"),
        ("knowledge_write", "Write or update a knowledge entry"),
        ("knowledge_list", "List all knowledge topics"),
        ("knowledge_delete", "Delete a knowledge entry"),
        ("reminder", "Set a timed reminder"),
        ("send_message", "Send a message to another channel"),
        ("link_identity", "Link a channel identity to a NeoMagi user"),
    ]
}

/// Convert a slice of tools to API-level tool definitions.
pub fn to_definitions(tools: &[Box<dyn Tool>]) -> Vec<ToolDefinition> {
    tools
        .iter()
        .map(|t| ToolDefinition {
            name: t.name().to_string(),
            description: t.description().to_string(),
            input_schema: t.input_schema(),
        })
        .collect()
}
