//! System prompt builder for the agent loop.

use std::path::Path;

use chatloop_core::role::AgentRole;

const DEFAULT_IDENTITY: &str = "You are a careful assistant that works inside the user's workspace.";

/// Everything the system message is assembled from.
#[derive(Debug, Clone, Copy)]
pub struct PromptInputs<'a> {
    pub role: AgentRole,
    /// Tool catalogue already filtered for `role`.
    pub catalogue: &'a str,
    pub workspace: Option<&'a Path>,
    /// Replaces the default identity line.
    pub custom: Option<&'a str>,
}

/// Build the system prompt sent ahead of every model turn.
pub fn build_system_prompt(inputs: PromptInputs<'_>) -> String {
    let mut parts = Vec::new();

    parts.push(inputs.custom.unwrap_or(DEFAULT_IDENTITY).to_string());

    let now = chrono::Utc::now();
    parts.push(format!("Current time: {}", now.format("%Y-%m-%d %H:%M:%S UTC")));

    if let Some(workspace) = inputs.workspace {
        parts.push(format!("Workspace directory: {}", workspace.display()));
    }

    match inputs.role {
        AgentRole::Planner => parts.push(
            "Role: planner. You may only inspect the workspace with read-only tools. \
             Describe the changes you would make as a plan instead of making them."
                .to_string(),
        ),
        AgentRole::Actor => parts.push("Role: actor. You may use every tool listed below.".to_string()),
    }

    if inputs.catalogue.trim().is_empty() {
        parts.push("No tools are available. Answer in plain text.".to_string());
    } else {
        parts.push(format!("--- Tools ---\n{}", inputs.catalogue));
        parts.push(protocol_section());
    }

    if let Some(workspace) = inputs.workspace {
        let agents_path = workspace.join("AGENTS.md");
        if let Ok(content) = std::fs::read_to_string(&agents_path) {
            parts.push(format!("--- Workspace Instructions ---\n{content}"));
        }
    }

    parts.join("\n\n")
}

fn protocol_section() -> String {
    [
        "--- Tool Calls ---",
        "To call a tool, reply with exactly one JSON object and nothing else:",
        r#"{"tool": "<tool name>", "parameters": {...}, "continue": true}"#,
        "Set \"continue\" to true when more steps follow after the result, or false when this call finishes the task.",
        "Call at most one tool per reply. When you are done, answer in plain text.",
        r#"To present a plan, reply with {"type": "plan", "goal": "...", "steps": [{"description": "..."}]}."#,
        r#"To ask the user something, reply with {"type": "question", "question": "...", "options": ["..."]}."#,
    ]
    .join("\n")
}
