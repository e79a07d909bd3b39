//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::role::AgentRole;

/// Top-level chatloop configuration, read from `~/.chatloop/config.json` (JSON5).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// Agent loop bounds and defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Model requests per loop (default: 10).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,

    /// Wall-clock budget per loop in seconds (default: 300).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loop_timeout_secs: Option<u64>,

    /// Corrective retries after malformed tool calls (default: 3).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_malformed_retries: Option<u32>,

    /// Per-execution tool timeout in seconds (default: 60).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_timeout_secs: Option<u64>,

    /// Consecutive failures of one tool before the loop is stopped (default: 3).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_consecutive_tool_failures: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<AgentRole>,

    /// Extra text prepended to every model request as a system message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Tools that always go through the approval gate.
    #[serde(default)]
    pub require_approval: Vec<String>,

    /// Tools that never go through the approval gate.
    #[serde(default)]
    pub auto_approve: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,

    /// Reject paths that resolve outside the workspace (default: true).
    #[serde(default = "default_true")]
    pub restrict_to_workspace: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            require_approval: Vec::new(),
            auto_approve: Vec::new(),
            workspace: None,
            restrict_to_workspace: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// OpenAI-compatible model endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

impl ProviderConfig {
    /// Resolve the API key: `api_key` first, then the `api_key_env` variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Conversation directory (default: `~/.chatloop/conversations`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate directives (e.g. "chatloop_agent=debug").
    #[serde(default)]
    pub filters: Vec<String>,
}

fn default_log_format() -> String {
    "plain".into()
}

/// Bounds applied to every agent loop run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopBounds {
    pub max_iterations: u32,
    pub loop_timeout: Duration,
    pub max_malformed_retries: u32,
    pub tool_timeout: Duration,
    pub max_consecutive_tool_failures: u32,
}

impl Default for LoopBounds {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            loop_timeout: Duration::from_secs(300),
            max_malformed_retries: 3,
            tool_timeout: Duration::from_secs(60),
            max_consecutive_tool_failures: 3,
        }
    }
}

impl From<&Config> for LoopBounds {
    fn from(config: &Config) -> Self {
        Self {
            max_iterations: config.max_iterations(),
            loop_timeout: config.loop_timeout(),
            max_malformed_retries: config.max_malformed_retries(),
            tool_timeout: config.tool_timeout(),
            max_consecutive_tool_failures: config.max_consecutive_tool_failures(),
        }
    }
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns with their environment values (missing → empty).
fn substitute_env_vars(input: &str) -> String {
    let Ok(re) = regex::Regex::new(r"\$\{([^}]+)\}") else {
        return input.to_string();
    };
    re.replace_all(input, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&raw);

        json5::from_str(&substituted).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Default config file path.
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json")
    }

    fn agent(&self) -> Option<&AgentConfig> {
        self.agent.as_ref()
    }

    pub fn max_iterations(&self) -> u32 {
        self.agent().and_then(|a| a.max_iterations).unwrap_or(10)
    }

    pub fn loop_timeout(&self) -> Duration {
        Duration::from_secs(self.agent().and_then(|a| a.loop_timeout_secs).unwrap_or(300))
    }

    pub fn max_malformed_retries(&self) -> u32 {
        self.agent().and_then(|a| a.max_malformed_retries).unwrap_or(3)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.agent().and_then(|a| a.tool_timeout_secs).unwrap_or(60))
    }

    pub fn max_consecutive_tool_failures(&self) -> u32 {
        self.agent()
            .and_then(|a| a.max_consecutive_tool_failures)
            .unwrap_or(3)
    }

    pub fn role(&self) -> AgentRole {
        self.agent().and_then(|a| a.role).unwrap_or_default()
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.agent().and_then(|a| a.system_prompt.as_deref())
    }

    pub fn tools(&self) -> ToolsConfig {
        self.tools.clone().unwrap_or_default()
    }

    /// Root directory the file tools operate in (default: current directory).
    pub fn workspace_dir(&self) -> PathBuf {
        self.tools
            .as_ref()
            .and_then(|t| t.workspace.as_ref())
            .map(|w| PathBuf::from(shellexpand::tilde(w).as_ref()))
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }

    pub fn store_dir(&self) -> PathBuf {
        self.store
            .as_ref()
            .and_then(|s| s.dir.as_ref())
            .map(|d| PathBuf::from(shellexpand::tilde(d).as_ref()))
            .unwrap_or_else(|| data_dir().join("conversations"))
    }

    pub fn model(&self) -> String {
        self.provider
            .as_ref()
            .and_then(|p| p.model.clone())
            .unwrap_or_else(|| "gpt-4o-mini".to_string())
    }

    /// Get a config value by dotted path (e.g. "agent.max_iterations").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if let Some(agent) = &self.agent {
            if agent.max_iterations == Some(0) {
                errors.push("agent.max_iterations must be at least 1".to_string());
            }
            if agent.loop_timeout_secs == Some(0) {
                errors.push("agent.loop_timeout_secs must be at least 1".to_string());
            }
            if agent.tool_timeout_secs == Some(0) {
                errors.push("agent.tool_timeout_secs must be at least 1".to_string());
            }
            if agent.max_consecutive_tool_failures == Some(0) {
                errors.push("agent.max_consecutive_tool_failures must be at least 1".to_string());
            }
        }

        match &self.provider {
            Some(provider) => {
                let local = provider
                    .base_url
                    .as_deref()
                    .is_some_and(|u| u.contains("localhost") || u.contains("127.0.0.1"));
                if !local && provider.resolve_api_key().is_none() {
                    warnings.push("Provider has no API key configured".to_string());
                }
            }
            None => warnings.push("No provider configured".to_string()),
        }

        if let Some(tools) = &self.tools {
            for name in &tools.require_approval {
                if tools.auto_approve.contains(name) {
                    errors.push(format!(
                        "Tool '{name}' is listed in both require_approval and auto_approve"
                    ));
                }
            }
            if let Some(ws) = &tools.workspace {
                let path = PathBuf::from(shellexpand::tilde(ws).as_ref());
                if !path.is_dir() {
                    warnings.push(format!("Workspace directory not found: {ws}"));
                }
            }
        }

        if let Some(logging) = &self.logging {
            if logging.format != "plain" && logging.format != "json" {
                warnings.push(format!(
                    "Unknown logging.format '{}', falling back to plain",
                    logging.format
                ));
            }
        }

        (warnings, errors)
    }
}

/// Base directory for chatloop data: `~/.chatloop/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".chatloop")
}
