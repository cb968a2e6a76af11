use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::config::CapabilityServerConfig;
use crate::error::{CapabilityError, ExecutorError, Result};
use crate::types::*;

/// LLM client: one chat completion per call.
pub trait LlmClient: Send + Sync + 'static {
    /// Provider name ("openai", "anthropic", ...).
    fn provider(&self) -> &str;

    /// Send a chat completion request.
    fn chat(&self, request: ChatRequest) -> BoxFuture<'_, std::result::Result<ChatResponse, ExecutorError>>;
}

/// Everything an executor gets to know about the call it is serving.
#[derive(Clone)]
pub struct ExecutorContext {
    pub execution_id: ExecutionId,
    pub workflow_id: String,
    pub step_key: String,
    pub attempt: u32,
    /// Deadline for this attempt, in milliseconds.
    pub timeout_ms: u64,
    /// Nesting depth of the current execution (0 = top level).
    pub depth: u32,
    pub cancel: CancellationToken,
    pub sub_workflows: Option<Arc<dyn SubWorkflowRunner>>,
}

impl ExecutorContext {
    /// A context for calling an executor outside of a scheduled execution.
    pub fn detached(step_key: impl Into<String>) -> Self {
        Self {
            execution_id: ExecutionId::new(),
            workflow_id: String::new(),
            step_key: step_key.into(),
            attempt: 1,
            timeout_ms: 60_000,
            depth: 0,
            cancel: CancellationToken::new(),
            sub_workflows: None,
        }
    }
}

/// Input handed to [`AgentExecutor::execute`].
#[derive(Clone)]
pub struct ExecutorInput {
    pub agent: Agent,
    /// Step inputs with templates already resolved.
    pub inputs: JsonMap,
    pub context: ExecutorContext,
}

/// Agent executor, one implementation per [`AgentType`].
///
/// Instances are created per call by the executor registry, so
/// `collect_metrics` reports on the most recent `execute`.
pub trait AgentExecutor: Send + 'static {
    /// The agent type this executor serves.
    fn agent_type(&self) -> AgentType;

    /// Check agent type and required config before dispatch.
    fn validate_input(&self, input: &ExecutorInput) -> std::result::Result<(), ExecutorError> {
        check_agent_type(self.agent_type(), &input.agent)
    }

    /// Run the agent.
    fn execute(
        &mut self,
        input: ExecutorInput,
    ) -> BoxFuture<'_, std::result::Result<ExecutionResult, ExecutorError>>;

    /// Metrics for the last call, if the executor tracks any.
    fn collect_metrics(&self) -> Option<ExecutionMetrics> {
        None
    }
}

/// Fail with `InvalidAgentType` unless `agent` has the expected type.
pub fn check_agent_type(expected: AgentType, agent: &Agent) -> std::result::Result<(), ExecutorError> {
    if agent.agent_type != expected {
        return Err(ExecutorError::InvalidAgentType {
            expected: expected.to_string(),
            actual: agent.agent_type.to_string(),
        });
    }
    Ok(())
}

/// Fail with `MissingConfig` unless every field is present and non-null.
pub fn require_config(agent: &Agent, fields: &[&str]) -> std::result::Result<(), ExecutorError> {
    for field in fields {
        match agent.config.get(*field) {
            None | Some(serde_json::Value::Null) => {
                return Err(ExecutorError::MissingConfig(field.to_string()))
            }
            _ => {}
        }
    }
    Ok(())
}

/// A live link to one capability server.
pub trait CapabilityTransport: Send + Sync + 'static {
    /// Invoke a named capability.
    fn call(
        &self,
        capability: String,
        params: serde_json::Value,
    ) -> BoxFuture<'_, std::result::Result<serde_json::Value, String>>;

    /// Cheap liveness probe.
    fn ping(&self) -> BoxFuture<'_, std::result::Result<(), String>>;

    /// Close the underlying session.
    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Opens transports for capability servers.
pub trait CapabilityConnector: Send + Sync + 'static {
    fn connect(
        &self,
        server: String,
        config: CapabilityServerConfig,
    ) -> BoxFuture<'_, std::result::Result<Arc<dyn CapabilityTransport>, CapabilityError>>;
}

/// Read side of the workflow CRUD layer.
pub trait WorkflowStore: Send + Sync + 'static {
    fn get_workflow(&self, id: &str) -> BoxFuture<'_, Result<Option<Workflow>>>;

    fn get_agent(&self, id: &str) -> BoxFuture<'_, Result<Option<Agent>>>;
}

/// Persistence for executions, step records, and execution logs.
pub trait ExecutionStore: Send + Sync + 'static {
    fn persist_execution(&self, execution: &Execution) -> BoxFuture<'_, Result<()>>;

    fn persist_step_record(&self, record: &StepExecutionRecord) -> BoxFuture<'_, Result<()>>;

    fn append_execution_log(&self, entry: &ExecutionLogEntry) -> BoxFuture<'_, Result<()>>;

    fn get_execution(&self, id: &ExecutionId) -> BoxFuture<'_, Result<Option<Execution>>>;

    fn list_executions(&self, workflow_id: &str) -> BoxFuture<'_, Result<Vec<Execution>>>;

    fn list_execution_logs(&self, id: &ExecutionId) -> BoxFuture<'_, Result<Vec<ExecutionLogEntry>>>;

    fn list_step_records(&self, id: &ExecutionId) -> BoxFuture<'_, Result<Vec<StepExecutionRecord>>>;
}

/// Request to run a nested workflow on behalf of a WORKFLOW agent.
#[derive(Clone)]
pub struct SubWorkflowRequest {
    pub workflow_id: String,
    pub input: serde_json::Value,
    pub parent_execution_id: ExecutionId,
    pub depth: u32,
    pub cancel: CancellationToken,
}

/// Runs a workflow to completion; implemented by the scheduler.
pub trait SubWorkflowRunner: Send + Sync + 'static {
    fn run_workflow(&self, request: SubWorkflowRequest) -> BoxFuture<'_, Result<Execution>>;
}
