//! Agent roles and the capability boundary consulted before a tool runs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Capability tier of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    /// Read-only tools only.
    Planner,
    #[default]
    Actor,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Planner => "planner",
            AgentRole::Actor => "actor",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "planner" => Ok(AgentRole::Planner),
            "actor" => Ok(AgentRole::Actor),
            other => Err(format!("unknown role '{other}' (expected planner or actor)")),
        }
    }
}

/// What the engine needs to know about tools, without running them.
pub trait CapabilityRegistry: Send + Sync {
    fn is_known(&self, tool: &str) -> bool;

    fn is_read_only(&self, tool: &str) -> bool;

    fn requires_approval(&self, tool: &str) -> bool;

    /// Names of the tools the given role may see and invoke.
    fn visible_tools(&self, role: AgentRole) -> Vec<String>;
}

/// How an invocation is gated for a role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gate {
    /// Run without asking.
    Auto,
    /// Park in the pending-approval slot.
    Approval,
    /// Never run; answer with a failure result.
    Denied(String),
}

/// Decide how `tool` is gated for `role`.
pub fn gate(registry: &dyn CapabilityRegistry, role: AgentRole, tool: &str) -> Gate {
    if !registry.is_known(tool) {
        return Gate::Denied(format!("Unknown tool '{tool}'"));
    }
    match role {
        AgentRole::Planner if !registry.is_read_only(tool) => Gate::Denied(format!(
            "Tool '{tool}' is not permitted for the planner role (read-only tools only)"
        )),
        AgentRole::Planner => Gate::Auto,
        AgentRole::Actor if registry.requires_approval(tool) => Gate::Approval,
        AgentRole::Actor => Gate::Auto,
    }
}
