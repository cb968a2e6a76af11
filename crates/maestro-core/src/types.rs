use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Unique execution identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Workflow definition ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepType {
    Agent,
    Condition,
    Loop,
    Parallel,
    Wait,
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepType::Agent => "AGENT",
            StepType::Condition => "CONDITION",
            StepType::Loop => "LOOP",
            StepType::Parallel => "PARALLEL",
            StepType::Wait => "WAIT",
        };
        f.write_str(s)
    }
}

/// What happens once a step's attempt budget is exhausted.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnError {
    #[default]
    Fail,
    Continue,
    Retry,
}

/// One node of a workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub step_key: String,
    pub step_type: StepType,
    #[serde(default)]
    pub position: u32,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub config: JsonMap,
    #[serde(default)]
    pub inputs: JsonMap,
    #[serde(default)]
    pub outputs: JsonMap,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub retry_delay_ms: u64,
    #[serde(default = "default_step_timeout")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub on_error: OnError,
}

fn default_step_timeout() -> u64 {
    300_000
}

impl WorkflowStep {
    /// Create an AGENT step bound to `agent_id`.
    pub fn agent(key: impl Into<String>, agent_id: impl Into<String>) -> Self {
        let mut step = Self::control(key, StepType::Agent);
        step.agent_id = Some(agent_id.into());
        step
    }

    /// Create a control step (CONDITION, LOOP, PARALLEL, WAIT).
    pub fn control(key: impl Into<String>, step_type: StepType) -> Self {
        Self {
            step_key: key.into(),
            step_type,
            position: 0,
            agent_id: None,
            config: JsonMap::new(),
            inputs: JsonMap::new(),
            outputs: JsonMap::new(),
            depends_on: vec![],
            retry_count: 0,
            retry_delay_ms: 0,
            timeout_ms: default_step_timeout(),
            on_error: OnError::Fail,
        }
    }

    pub fn with_depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_position(mut self, position: u32) -> Self {
        self.position = position;
        self
    }

    pub fn with_retry(mut self, retry_count: u32, retry_delay_ms: u64) -> Self {
        self.retry_count = retry_count;
        self.retry_delay_ms = retry_delay_ms;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }

    /// Replace the config map. Non-object values are ignored.
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        if let serde_json::Value::Object(map) = config {
            self.config = map;
        }
        self
    }

    /// Replace the inputs map. Non-object values are ignored.
    pub fn with_inputs(mut self, inputs: serde_json::Value) -> Self {
        if let serde_json::Value::Object(map) = inputs {
            self.inputs = map;
        }
        self
    }

    /// Total attempts allowed: the first try plus `retry_count` retries.
    pub fn max_attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    #[default]
    Draft,
    Active,
    Paused,
    Archived,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: WorkflowStatus,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
}

impl Workflow {
    pub fn new(id: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            status: WorkflowStatus::Active,
            steps,
        }
    }
}

// ── Agents ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentType {
    Code,
    Api,
    Llm,
    Data,
    Workflow,
}

impl AgentType {
    pub const ALL: [AgentType; 5] = [
        AgentType::Code,
        AgentType::Api,
        AgentType::Llm,
        AgentType::Data,
        AgentType::Workflow,
    ];
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentType::Code => "CODE",
            AgentType::Api => "API",
            AgentType::Llm => "LLM",
            AgentType::Data => "DATA",
            AgentType::Workflow => "WORKFLOW",
        };
        f.write_str(s)
    }
}

/// Executor configuration bound to AGENT steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    #[serde(default)]
    pub config: JsonMap,
    #[serde(default = "default_max_execution_time")]
    pub max_execution_time_ms: u64,
    #[serde(default = "default_max_memory")]
    pub max_memory_mb: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_executions: u32,
}

fn default_max_execution_time() -> u64 {
    60_000
}
fn default_max_memory() -> u64 {
    512
}
fn default_max_concurrent() -> u32 {
    4
}

impl Agent {
    pub fn new(id: impl Into<String>, agent_type: AgentType) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            agent_type,
            config: JsonMap::new(),
            max_execution_time_ms: default_max_execution_time(),
            max_memory_mb: default_max_memory(),
            max_concurrent_executions: default_max_concurrent(),
        }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        if let serde_json::Value::Object(map) = config {
            self.config = map;
        }
        self
    }

    pub fn with_max_concurrent(mut self, n: u32) -> Self {
        self.max_concurrent_executions = n;
        self
    }

    /// Read a string config field.
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }
}

// ── Executions ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl ExecutionStatus {
    /// Terminal statuses are absorbing.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Cancelled
                | ExecutionStatus::Timeout
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "PENDING",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Completed => "COMPLETED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Cancelled => "CANCELLED",
            ExecutionStatus::Timeout => "TIMEOUT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            "TIMEOUT" => Some(Self::Timeout),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerType {
    #[default]
    Manual,
    Scheduled,
    Api,
    Webhook,
    Event,
}

impl std::str::FromStr for TriggerType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "manual" => Ok(TriggerType::Manual),
            "scheduled" => Ok(TriggerType::Scheduled),
            "api" => Ok(TriggerType::Api),
            "webhook" => Ok(TriggerType::Webhook),
            "event" => Ok(TriggerType::Event),
            other => Err(format!("unknown trigger type '{}'", other)),
        }
    }
}

/// One run of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: ExecutionId,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub trigger_type: TriggerType,
    pub steps_total: u32,
    pub steps_completed: u32,
    pub steps_failed: u32,
    #[serde(default)]
    pub input_data: serde_json::Value,
    #[serde(default)]
    pub output_data: Option<serde_json::Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub parent_execution_id: Option<ExecutionId>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Execution {
    pub fn new(
        workflow_id: impl Into<String>,
        trigger_type: TriggerType,
        input_data: serde_json::Value,
        steps_total: u32,
    ) -> Self {
        Self {
            id: ExecutionId::new(),
            workflow_id: workflow_id.into(),
            status: ExecutionStatus::Pending,
            trigger_type,
            steps_total,
            steps_completed: 0,
            steps_failed: 0,
            input_data,
            output_data: None,
            error_message: None,
            parent_execution_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped | StepStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "PENDING",
            StepStatus::Running => "RUNNING",
            StepStatus::Completed => "COMPLETED",
            StepStatus::Failed => "FAILED",
            StepStatus::Skipped => "SKIPPED",
            StepStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of one attempt of one step instance inside an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepExecutionRecord {
    pub execution_id: ExecutionId,
    pub step_key: String,
    pub attempt: u32,
    #[serde(default)]
    pub iteration: Option<usize>,
    pub status: StepStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl StepExecutionRecord {
    pub fn started(execution_id: &ExecutionId, step_key: &str, attempt: u32) -> Self {
        Self {
            execution_id: execution_id.clone(),
            step_key: step_key.to_string(),
            attempt,
            iteration: None,
            status: StepStatus::Running,
            started_at: Some(Utc::now()),
            completed_at: None,
            output: None,
            error: None,
        }
    }

    /// A record for a step that never ran.
    pub fn skipped(execution_id: &ExecutionId, step_key: &str) -> Self {
        Self {
            execution_id: execution_id.clone(),
            step_key: step_key.to_string(),
            attempt: 0,
            iteration: None,
            status: StepStatus::Skipped,
            started_at: None,
            completed_at: Some(Utc::now()),
            output: None,
            error: None,
        }
    }

    pub fn complete(mut self, output: serde_json::Value) -> Self {
        self.status = StepStatus::Completed;
        self.output = Some(output);
        self.completed_at = Some(Utc::now());
        self
    }

    pub fn fail(mut self, error: impl Into<String>) -> Self {
        self.status = StepStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
        self
    }

    pub fn cancel(mut self) -> Self {
        self.status = StepStatus::Cancelled;
        self.error = Some("cancelled".to_string());
        self.completed_at = Some(Utc::now());
        self
    }
}

// ── Logs and metrics ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DEBUG" => Some(Self::Debug),
            "INFO" => Some(Self::Info),
            "WARN" => Some(Self::Warn),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLogEntry {
    pub execution_id: ExecutionId,
    #[serde(default)]
    pub step_key: Option<String>,
    #[serde(default)]
    pub attempt: Option<u32>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl ExecutionLogEntry {
    pub fn new(execution_id: &ExecutionId, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.clone(),
            step_key: None,
            attempt: None,
            level,
            message: message.into(),
            data: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn for_step(mut self, step_key: &str, attempt: Option<u32>) -> Self {
        self.step_key = Some(step_key.to_string());
        self.attempt = attempt;
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// A log line emitted by an executor during one call.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorLog {
    pub level: LogLevel,
    pub message: String,
    pub data: serde_json::Value,
}

impl ExecutorLog {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            data: serde_json::Value::Null,
        }
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warn, message)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message)
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// Per-call metrics collected from an executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetrics {
    pub duration_ms: u64,
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub api_calls: u32,
}

/// Successful executor output.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub output: serde_json::Value,
    pub logs: Vec<ExecutorLog>,
}

impl ExecutionResult {
    pub fn new(output: serde_json::Value) -> Self {
        Self {
            output,
            logs: vec![],
        }
    }

    pub fn with_log(mut self, log: ExecutorLog) -> Self {
        self.logs.push(log);
        self
    }
}

// ── LLM chat types ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: text.into(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
        }
    }
}

/// A provider-neutral chat completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: u32,
    pub json_mode: bool,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

/// Token usage normalized across providers.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub usage: TokenUsage,
    pub finish_reason: Option<String>,
}

// ── Capabilities ────────────────────────────────────────────────

/// Result of a capability invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationResult {
    pub capability: String,
    pub content: serde_json::Value,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub healthy: bool,
    pub response_time_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_deserializes_camel_case() {
        let json = serde_json::json!({
            "stepKey": "fetch",
            "stepType": "AGENT",
            "agentId": "http",
            "dependsOn": ["a"],
            "retryCount": 2,
            "onError": "CONTINUE"
        });
        let step: WorkflowStep = serde_json::from_value(json).unwrap();
        assert_eq!(step.step_key, "fetch");
        assert_eq!(step.step_type, StepType::Agent);
        assert_eq!(step.agent_id.as_deref(), Some("http"));
        assert_eq!(step.max_attempts(), 3);
        assert_eq!(step.on_error, OnError::Continue);
        assert_eq!(step.timeout_ms, 300_000);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Timeout.is_terminal());
        assert!(StepStatus::Skipped.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
    }

    #[test]
    fn test_status_string_roundtrip() {
        for s in [
            ExecutionStatus::Pending,
            ExecutionStatus::Cancelled,
            ExecutionStatus::Timeout,
        ] {
            assert_eq!(ExecutionStatus::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn test_agent_type_field_is_named_type() {
        let agent: Agent = serde_json::from_value(serde_json::json!({
            "id": "gpt",
            "type": "LLM",
            "config": { "provider": "openai" }
        }))
        .unwrap();
        assert_eq!(agent.agent_type, AgentType::Llm);
        assert_eq!(agent.config_str("provider"), Some("openai"));
        assert_eq!(agent.max_concurrent_executions, 4);
    }

    #[test]
    fn test_token_usage_total() {
        let usage = TokenUsage::new(12, 30);
        assert_eq!(usage.total_tokens, 42);
    }
}
