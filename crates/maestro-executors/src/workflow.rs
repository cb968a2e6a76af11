use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use maestro_core::error::ExecutorError;
use maestro_core::template::resolve_value;
use maestro_core::traits::{check_agent_type, require_config, AgentExecutor, ExecutorInput, SubWorkflowRequest};
use maestro_core::types::*;

use crate::parse_config;

/// Runs another workflow to completion as a single step.
#[derive(Default)]
pub struct WorkflowExecutor {
    metrics: Option<ExecutionMetrics>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkflowAgentConfig {
    workflow_id: String,
    /// Child input; templates resolve against the step inputs. Defaults to
    /// the step inputs themselves.
    #[serde(default)]
    input: Option<Value>,
}

impl WorkflowExecutor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AgentExecutor for WorkflowExecutor {
    fn agent_type(&self) -> AgentType {
        AgentType::Workflow
    }

    fn validate_input(&self, input: &ExecutorInput) -> Result<(), ExecutorError> {
        check_agent_type(AgentType::Workflow, &input.agent)?;
        require_config(&input.agent, &["workflowId"])?;
        parse_config::<WorkflowAgentConfig>(&input.agent)?;
        Ok(())
    }

    fn execute(
        &mut self,
        input: ExecutorInput,
    ) -> BoxFuture<'_, Result<ExecutionResult, ExecutorError>> {
        Box::pin(async move {
            let config: WorkflowAgentConfig = parse_config(&input.agent)?;
            let runner = input.context.sub_workflows.clone().ok_or_else(|| {
                ExecutorError::InvalidConfig("nested workflows are not available here".into())
            })?;

            let vars = Value::Object(input.inputs.clone());
            let child_input = match &config.input {
                Some(template) => resolve_value(template, &vars),
                None => vars,
            };

            info!(
                parent = %input.context.execution_id,
                workflow_id = %config.workflow_id,
                depth = input.context.depth + 1,
                "Starting nested workflow"
            );

            let started = std::time::Instant::now();
            let child = runner
                .run_workflow(SubWorkflowRequest {
                    workflow_id: config.workflow_id.clone(),
                    input: child_input,
                    parent_execution_id: input.context.execution_id.clone(),
                    depth: input.context.depth + 1,
                    cancel: input.context.cancel.child_token(),
                })
                .await
                .map_err(|e| ExecutorError::Workflow(e.to_string()))?;

            self.metrics = Some(ExecutionMetrics {
                duration_ms: started.elapsed().as_millis() as u64,
                ..Default::default()
            });

            match child.status {
                ExecutionStatus::Completed => Ok(ExecutionResult::new(json!({
                    "executionId": child.id,
                    "status": child.status,
                    "output": child.output_data,
                    "stepsCompleted": child.steps_completed,
                    "stepsFailed": child.steps_failed,
                }))),
                ExecutionStatus::Cancelled if input.context.cancel.is_cancelled() => {
                    Err(ExecutorError::Cancelled)
                }
                status => Err(ExecutorError::Workflow(format!(
                    "child execution {} ended {}: {}",
                    child.id,
                    status,
                    child.error_message.as_deref().unwrap_or("no error message")
                ))),
            }
        })
    }

    fn collect_metrics(&self) -> Option<ExecutionMetrics> {
        self.metrics.clone()
    }
}
