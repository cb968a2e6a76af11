use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{MaestroError, Result};

/// Top-level Maestro configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub mcp: Option<McpConfig>,
    #[serde(default)]
    pub cron: Option<CronConfig>,
}

/// Scheduler limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum steps in flight per execution.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Wall-clock deadline for a whole execution.
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout_ms: u64,
    /// Maximum depth of nested WORKFLOW executions.
    #[serde(default = "default_max_nesting_depth")]
    pub max_nesting_depth: u32,
    /// Broadcast capacity of the execution event bus.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            execution_timeout_ms: default_execution_timeout(),
            max_nesting_depth: default_max_nesting_depth(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_max_in_flight() -> usize { 8 }
fn default_execution_timeout() -> u64 { 3_600_000 }
fn default_max_nesting_depth() -> u32 { 4 }
fn default_event_capacity() -> usize { 256 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String { "~/.maestro/maestro.db".to_string() }

impl StoreConfig {
    /// Resolve the database path (expand ~).
    pub fn resolved_path(&self) -> PathBuf {
        expand_home(&self.path)
    }
}

/// JSONL execution logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: ~/.maestro/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = execution summary, 2 = per-step, 3 = per-attempt and log lines.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: default_log_level(),
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

impl LogConfig {
    pub fn resolved_dir(&self) -> PathBuf {
        expand_home(self.log_dir.as_deref().unwrap_or("~/.maestro/logs"))
    }
}

/// Per-provider LLM overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub openai: Option<ProviderConfig>,
    #[serde(default)]
    pub anthropic: Option<ProviderConfig>,
}

impl LlmConfig {
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        match name {
            "openai" => self.openai.as_ref(),
            "anthropic" => self.anthropic.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
}

/// Isolation for the CODE executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// "process" or "docker".
    #[serde(default = "default_sandbox_mode")]
    pub mode: String,
    #[serde(default = "default_sandbox_image")]
    pub image: String,
    /// Working directory for process-mode runs. Default: system temp dir.
    #[serde(default)]
    pub work_dir: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            mode: default_sandbox_mode(),
            image: default_sandbox_image(),
            work_dir: None,
        }
    }
}

fn default_sandbox_mode() -> String { "process".to_string() }
fn default_sandbox_image() -> String { "python:3.12-slim".to_string() }

/// MCP capability servers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default)]
    pub servers: HashMap<String, CapabilityServerConfig>,
}

/// Configuration for one capability server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityServerConfig {
    pub transport: McpTransport,
    #[serde(default = "default_auto_connect")]
    pub auto_connect: bool,
    /// Capabilities callers may invoke on this server.
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    /// Per-invocation timeout in seconds.
    #[serde(default = "default_mcp_timeout")]
    pub timeout_secs: u64,
}

fn default_auto_connect() -> bool { true }
fn default_mcp_timeout() -> u64 { 120 }

impl CapabilityServerConfig {
    pub fn new(transport: McpTransport, capabilities: Vec<String>) -> Self {
        Self {
            transport,
            auto_connect: default_auto_connect(),
            capabilities,
            rate_limit: RateLimitConfig::default(),
            backoff: BackoffConfig::default(),
            timeout_secs: default_mcp_timeout(),
        }
    }
}

/// MCP transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum McpTransport {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Http {
        url: String,
    },
}

/// Fixed-window request limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_ms: default_window_ms(),
        }
    }
}

fn default_max_requests() -> u32 { 60 }
fn default_window_ms() -> u64 { 60_000 }

/// Advisory exponential backoff for failed invocations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_base_delay() -> u64 { 500 }
fn default_max_delay() -> u64 { 30_000 }
fn default_max_retries() -> u32 { 5 }

/// Scheduled workflow triggers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CronConfig {
    #[serde(default)]
    pub jobs: Vec<CronJobConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJobConfig {
    pub name: String,
    /// Cron expression with seconds field, e.g. "0 0 2 * * *".
    pub schedule: String,
    pub workflow_id: String,
    #[serde(default)]
    pub input: Option<serde_json::Value>,
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| MaestroError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| MaestroError::Config(e.to_string()))
    }

    /// Load the config if the file exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}
