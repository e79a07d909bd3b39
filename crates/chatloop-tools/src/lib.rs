//! Tools the agent loop may invoke, and the registry that executes them.
//!
//! Each tool implements [`Tool`]. [`ToolRegistry`] answers capability
//! questions for the engine (known? read-only? gated?) and runs tools through
//! the [`ToolExecutor`] boundary.

use std::collections::HashSet;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use chatloop_core::config::{Config, ToolsConfig};
use chatloop_core::message::ToolParams;
use chatloop_core::role::{AgentRole, CapabilityRegistry};

pub mod list_directory;
pub mod path_guard;
pub mod read_file;
pub mod write_file;

/// Environment handed to every tool execution.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub workspace: PathBuf,
    pub restrict_to_workspace: bool,
}

impl ToolContext {
    pub fn from_config(config: &Config) -> Self {
        Self {
            workspace: config.workspace_dir(),
            restrict_to_workspace: config.tools().restrict_to_workspace,
        }
    }
}

/// Output from a tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name as used in invocations (e.g. "read_file").
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema describing the tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Read-only tools never modify anything and are open to the planner role.
    fn is_read_only(&self) -> bool {
        false
    }

    /// Whether the actor role must ask before running this tool.
    fn requires_approval(&self) -> bool {
        !self.is_read_only()
    }

    async fn execute(&self, params: serde_json::Value, context: &ToolContext) -> anyhow::Result<ToolOutput>;
}

/// The consumed tool boundary: run a named tool once gating has passed.
#[async_trait]
pub trait ToolExecutor: CapabilityRegistry {
    async fn execute(&self, tool: &str, params: ToolParams) -> anyhow::Result<ToolOutput>;

    /// Tool catalogue shown to the model for `role`.
    fn catalogue(&self, role: AgentRole) -> String {
        self.visible_tools(role)
            .iter()
            .map(|name| format!("- {name}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Registry of available tools plus approval overrides from config.
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
    context: ToolContext,
    require_approval: HashSet<String>,
    auto_approve: HashSet<String>,
}

impl ToolRegistry {
    pub fn new(context: ToolContext) -> Self {
        Self {
            tools: Vec::new(),
            context,
            require_approval: HashSet::new(),
            auto_approve: HashSet::new(),
        }
    }

    /// Registry with the built-in workspace tools and config overrides applied.
    pub fn with_builtins(context: ToolContext, config: &ToolsConfig) -> Self {
        let mut registry = Self::new(context).with_overrides(config);
        registry.register(Box::new(list_directory::ListDirectoryTool));
        registry.register(Box::new(read_file::ReadFileTool));
        registry.register(Box::new(write_file::WriteFileTool));
        registry
    }

    pub fn with_overrides(mut self, config: &ToolsConfig) -> Self {
        self.require_approval = config.require_approval.iter().cloned().collect();
        self.auto_approve = config.auto_approve.iter().cloned().collect();
        self
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.retain(|t| t.name() != tool.name());
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.iter().find(|t| t.name() == name).map(|t| t.as_ref())
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn context(&self) -> &ToolContext {
        &self.context
    }

    /// Plain-text tool catalogue for the given role, used in the system message.
    pub fn describe(&self, role: AgentRole) -> String {
        let visible = self.visible_tools(role);
        self.tools
            .iter()
            .filter(|t| visible.iter().any(|v| v == t.name()))
            .map(|t| {
                format!(
                    "- {}: {}\n  parameters: {}",
                    t.name(),
                    t.description(),
                    t.parameters_schema()
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl CapabilityRegistry for ToolRegistry {
    fn is_known(&self, tool: &str) -> bool {
        self.get(tool).is_some()
    }

    fn is_read_only(&self, tool: &str) -> bool {
        self.get(tool).is_some_and(|t| t.is_read_only())
    }

    fn requires_approval(&self, tool: &str) -> bool {
        if self.require_approval.contains(tool) {
            return true;
        }
        if self.auto_approve.contains(tool) {
            return false;
        }
        self.get(tool).is_some_and(|t| t.requires_approval())
    }

    fn visible_tools(&self, role: AgentRole) -> Vec<String> {
        self.tools
            .iter()
            .filter(|t| role == AgentRole::Actor || t.is_read_only())
            .map(|t| t.name().to_string())
            .collect()
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    async fn execute(&self, tool: &str, params: ToolParams) -> anyhow::Result<ToolOutput> {
        let Some(handler) = self.get(tool) else {
            anyhow::bail!("unknown tool '{tool}'");
        };
        debug!(tool, "Executing tool");
        handler
            .execute(serde_json::Value::Object(params), &self.context)
            .await
    }

    fn catalogue(&self, role: AgentRole) -> String {
        self.describe(role)
    }
}
