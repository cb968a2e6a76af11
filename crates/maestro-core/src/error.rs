use thiserror::Error;

use crate::types::ExecutionStatus;

/// Structural problems with a workflow definition.
///
/// Raised when a workflow is activated or an execution is requested, never
/// while an execution is running.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Dependency cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("Duplicate step key: {0}")]
    DuplicateKey(String),

    #[error("Invalid step key '{0}' (allowed: A-Z a-z 0-9 _ -)")]
    InvalidStepKey(String),

    #[error("AGENT step '{0}' has no agent_id")]
    MissingAgent(String),

    #[error("Step '{0}' must have a timeout greater than zero")]
    InvalidTimeout(String),

    #[error("Invalid {step_type} step '{step}': {reason}")]
    InvalidControlStep {
        step: String,
        step_type: String,
        reason: String,
    },
}

/// Errors produced by the capability (MCP) connection layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("Capability server '{0}' is not connected")]
    NotConnected(String),

    #[error("Rate limited on '{server}', retry after {retry_after_ms}ms")]
    RateLimited { server: String, retry_after_ms: u64 },

    #[error("Unknown capability '{capability}' on server '{server}'")]
    UnknownCapability { server: String, capability: String },

    #[error("Capability '{capability}' failed: {message} (retry after {retry_after_ms}ms)")]
    InvocationFailed {
        capability: String,
        message: String,
        retry_after_ms: u64,
    },

    #[error("Capability transport error: {0}")]
    Transport(String),
}

/// Typed failures returned by agent executors.
///
/// Executors report expected failure modes through this enum rather than
/// panicking; the step runner turns them into FAILED step records.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecutorError {
    #[error("Executor for {expected} cannot run agent of type {actual}")]
    InvalidAgentType { expected: String, actual: String },

    #[error("Missing required config field: {0}")]
    MissingConfig(String),

    #[error("Invalid executor config: {0}")]
    InvalidConfig(String),

    // Code
    #[error("Compile error: {0}")]
    CompileError(String),

    #[error("Runtime error (exit code {exit_code:?}): {message}")]
    CodeRuntime {
        exit_code: Option<i32>,
        message: String,
    },

    #[error("Resource limit exceeded: {0}")]
    ResourceLimitExceeded(String),

    // Api
    #[error("HTTP {status}: {body}")]
    ApiHttp { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out after {0}ms")]
    Timeout(u64),

    // Llm
    #[error("LLM provider returned HTTP {status}: {body}")]
    LlmProvider { status: u16, body: String },

    #[error("LLM provider not supported: {0}")]
    UnsupportedProvider(String),

    // Data
    #[error("Data pipeline error: {0}")]
    DataPipeline(String),

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error("Nested workflow failed: {0}")]
    Workflow(String),

    #[error("Executor cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum MaestroError {
    #[error("Workflow validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Step '{step}' timed out after {timeout_ms}ms")]
    StepTimeout { step: String, timeout_ms: u64 },

    #[error("Step '{step}' failed: {source}")]
    StepExecution {
        step: String,
        #[source]
        source: ExecutorError,
    },

    #[error("Step '{step}' failed after {attempts} attempt(s): {last_error}")]
    RetryExhausted {
        step: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Execution cancelled")]
    Cancelled,

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Execution {id} cannot be cancelled in status {status}")]
    NotCancellable { id: String, status: ExecutionStatus },

    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("MCP error: {0}")]
    Mcp(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MaestroError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_shows_path() {
        let err = ValidationError::Cycle {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Dependency cycle detected: a -> b -> a");
    }

    #[test]
    fn test_capability_error_wraps_into_executor_error() {
        let err: ExecutorError = CapabilityError::NotConnected("search".into()).into();
        assert!(matches!(err, ExecutorError::Capability(_)));
        assert!(err.to_string().contains("search"));
    }
}
