use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use maestro_core::error::{ExecutorError, MaestroError};
use maestro_core::template::resolve_value;
use maestro_core::traits::{ExecutorContext, ExecutorInput, SubWorkflowRunner, WorkflowStore};
use maestro_core::types::*;
use maestro_executors::ExecutorRegistry;

use crate::limits::AgentLimiter;
use crate::trace::ExecutionTrace;

/// Scheduling verdict for a finished step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Succeeded,
    /// Failed with `on_error = CONTINUE`; dependents still run.
    Tolerated,
    /// Failed and aborts the execution.
    Fatal,
    Cancelled,
}

/// Outcome of running one step instance through all of its attempts.
#[derive(Debug, Clone)]
pub struct StepRun {
    pub step_key: String,
    pub disposition: Disposition,
    pub status: StepStatus,
    pub attempts: u32,
    pub output: Option<Value>,
    pub error: Option<String>,
}

impl StepRun {
    pub fn succeeded(step_key: &str, attempts: u32, output: Value) -> Self {
        Self {
            step_key: step_key.to_string(),
            disposition: Disposition::Succeeded,
            status: StepStatus::Completed,
            attempts,
            output: Some(output),
            error: None,
        }
    }

    /// A failure whose disposition follows the step's `on_error`.
    pub fn failed(step: &WorkflowStep, attempts: u32, error: String) -> Self {
        let disposition = match step.on_error {
            OnError::Continue => Disposition::Tolerated,
            OnError::Fail | OnError::Retry => Disposition::Fatal,
        };
        Self {
            step_key: step.step_key.clone(),
            disposition,
            status: StepStatus::Failed,
            attempts,
            output: None,
            error: Some(error),
        }
    }

    pub fn cancelled(step_key: &str, attempts: u32) -> Self {
        Self {
            step_key: step_key.to_string(),
            disposition: Disposition::Cancelled,
            status: StepStatus::Cancelled,
            attempts,
            output: None,
            error: None,
        }
    }
}

/// What a step can see while it runs.
#[derive(Clone)]
pub struct StepContext {
    pub trace: Arc<ExecutionTrace>,
    pub workflow_id: String,
    /// Template scope: `input`, `steps`, and inside loops `loop` plus the
    /// item variable.
    pub scope: Value,
    pub iteration: Option<usize>,
    pub depth: u32,
    pub sub_workflows: Option<Arc<dyn SubWorkflowRunner>>,
}

impl StepContext {
    /// Resolve a step's `inputs` templates against the scope.
    pub fn resolve_inputs(&self, step: &WorkflowStep) -> JsonMap {
        match resolve_value(&Value::Object(step.inputs.clone()), &self.scope) {
            Value::Object(map) => map,
            _ => JsonMap::new(),
        }
    }

    /// A RUNNING record for this step instance.
    pub fn attempt_record(&self, step_key: &str, attempt: u32) -> StepExecutionRecord {
        let mut record = StepExecutionRecord::started(self.trace.id(), step_key, attempt);
        record.iteration = self.iteration;
        record
    }
}

enum AttemptError {
    Executor(ExecutorError),
    Timeout(u64),
}

impl AttemptError {
    fn into_maestro(self, step_key: &str) -> MaestroError {
        match self {
            AttemptError::Executor(source) => MaestroError::StepExecution {
                step: step_key.to_string(),
                source,
            },
            AttemptError::Timeout(timeout_ms) => MaestroError::StepTimeout {
                step: step_key.to_string(),
                timeout_ms,
            },
        }
    }
}

/// Runs AGENT steps: agent lookup, concurrency permit, input validation,
/// and the executor call under the step deadline, with fixed-delay retries.
pub struct StepRunner {
    registry: Arc<ExecutorRegistry>,
    workflows: Arc<dyn WorkflowStore>,
    limiter: Arc<AgentLimiter>,
}

impl StepRunner {
    pub fn new(
        registry: Arc<ExecutorRegistry>,
        workflows: Arc<dyn WorkflowStore>,
        limiter: Arc<AgentLimiter>,
    ) -> Self {
        Self {
            registry,
            workflows,
            limiter,
        }
    }

    pub async fn run(&self, step: &WorkflowStep, ctx: &StepContext, cancel: &CancellationToken) -> StepRun {
        let max_attempts = step.max_attempts();
        let mut last_error: Option<MaestroError> = None;

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return StepRun::cancelled(&step.step_key, attempt - 1);
            }

            let record = ctx.attempt_record(&step.step_key, attempt);
            ctx.trace.record_attempt(record.clone()).await;
            debug!(
                execution_id = %ctx.trace.id(),
                step_key = %step.step_key,
                attempt,
                "Step attempt started"
            );

            let attempt_token = cancel.child_token();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = tokio::time::timeout(
                    Duration::from_millis(step.timeout_ms),
                    self.attempt(step, ctx, attempt, attempt_token.clone()),
                ) => Some(result.unwrap_or(Err(AttemptError::Timeout(step.timeout_ms)))),
            };
            // Anything the executor spawned with the attempt token stops here.
            attempt_token.cancel();

            let result = match outcome {
                Some(result) => result,
                None => {
                    ctx.trace.record_attempt(record.cancel()).await;
                    info!(step_key = %step.step_key, attempt, "Step cancelled");
                    return StepRun::cancelled(&step.step_key, attempt);
                }
            };

            match result {
                Ok(output) => {
                    ctx.trace.record_attempt(record.complete(output.clone())).await;
                    return StepRun::succeeded(&step.step_key, attempt, output);
                }
                Err(AttemptError::Executor(ExecutorError::Cancelled)) if cancel.is_cancelled() => {
                    ctx.trace.record_attempt(record.cancel()).await;
                    return StepRun::cancelled(&step.step_key, attempt);
                }
                Err(e) => {
                    let err = e.into_maestro(&step.step_key);
                    warn!(
                        execution_id = %ctx.trace.id(),
                        step_key = %step.step_key,
                        attempt,
                        max_attempts,
                        error = %err,
                        "Step attempt failed"
                    );
                    ctx.trace.record_attempt(record.fail(err.to_string())).await;
                    ctx.trace
                        .log(LogLevel::Error, Some(&step.step_key), Some(attempt), err.to_string())
                        .await;
                    last_error = Some(err);
                }
            }

            if attempt < max_attempts && step.retry_delay_ms > 0 {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return StepRun::cancelled(&step.step_key, attempt),
                    _ = tokio::time::sleep(Duration::from_millis(step.retry_delay_ms)) => {}
                }
            }
        }

        let last = last_error.map(|e| e.to_string()).unwrap_or_default();
        let error = if max_attempts > 1 {
            MaestroError::RetryExhausted {
                step: step.step_key.clone(),
                attempts: max_attempts,
                last_error: last,
            }
            .to_string()
        } else {
            last
        };
        StepRun::failed(step, max_attempts, error)
    }

    async fn attempt(
        &self,
        step: &WorkflowStep,
        ctx: &StepContext,
        attempt: u32,
        token: CancellationToken,
    ) -> Result<Value, AttemptError> {
        let agent_id = step.agent_id.as_deref().unwrap_or_default();
        let agent = match self.workflows.get_agent(agent_id).await {
            Ok(Some(agent)) => agent,
            Ok(None) => {
                return Err(AttemptError::Executor(ExecutorError::InvalidConfig(format!(
                    "agent '{}' not found",
                    agent_id
                ))))
            }
            Err(e) => return Err(AttemptError::Executor(ExecutorError::InvalidConfig(e.to_string()))),
        };

        let _permit = self
            .limiter
            .acquire(&agent)
            .await
            .ok_or(AttemptError::Executor(ExecutorError::Cancelled))?;

        let mut executor = self
            .registry
            .create(agent.agent_type)
            .map_err(AttemptError::Executor)?;

        let input = ExecutorInput {
            inputs: ctx.resolve_inputs(step),
            context: ExecutorContext {
                execution_id: ctx.trace.id().clone(),
                workflow_id: ctx.workflow_id.clone(),
                step_key: step.step_key.clone(),
                attempt,
                timeout_ms: step.timeout_ms,
                depth: ctx.depth,
                cancel: token,
                sub_workflows: ctx.sub_workflows.clone(),
            },
            agent,
        };
        executor.validate_input(&input).map_err(AttemptError::Executor)?;

        let agent_id = input.agent.id.clone();
        let result = executor.execute(input).await;

        if let Some(metrics) = executor.collect_metrics() {
            let entry = ExecutionLogEntry::new(ctx.trace.id(), LogLevel::Debug, "executor metrics")
                .for_step(&step.step_key, Some(attempt))
                .with_data(json!({ "agentId": agent_id, "metrics": metrics }));
            ctx.trace.append_log(entry).await;
        }

        let result = result.map_err(AttemptError::Executor)?;
        for log in result.logs {
            let entry = ExecutionLogEntry::new(ctx.trace.id(), log.level, log.message)
                .for_step(&step.step_key, Some(attempt))
                .with_data(log.data);
            ctx.trace.append_log(entry).await;
        }
        Ok(result.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_core::event::EventBus;
    use maestro_core::traits::ExecutionStore;
    use maestro_executors::ExecutorDeps;
    use maestro_store::MemoryStore;
    use maestro_test_utils::{agent, MockOutcome, MockScript};

    struct Harness {
        store: Arc<MemoryStore>,
        script: Arc<MockScript>,
        runner: StepRunner,
        ctx: StepContext,
    }

    async fn harness(agents: &[Agent]) -> Harness {
        let store = Arc::new(MemoryStore::new());
        for a in agents {
            store.save_agent(a).unwrap();
        }
        let script = MockScript::new();
        let mut registry = ExecutorRegistry::new(ExecutorDeps::default());
        for agent_type in AgentType::ALL {
            let script = script.clone();
            registry.register(
                agent_type,
                Arc::new(move |_: &ExecutorDeps| -> Box<dyn maestro_core::traits::AgentExecutor> {
                    Box::new(script.executor(agent_type))
                }),
            );
        }
        let execution = Execution::new("wf", TriggerType::Manual, json!({ "n": 2 }), 1);
        let trace = ExecutionTrace::create(execution, store.clone(), Arc::new(EventBus::default()))
            .await
            .unwrap();
        let runner = StepRunner::new(Arc::new(registry), store.clone(), Arc::new(AgentLimiter::new()));
        let ctx = StepContext {
            trace: Arc::new(trace),
            workflow_id: "wf".into(),
            scope: json!({ "input": { "n": 2 }, "steps": {} }),
            iteration: None,
            depth: 0,
            sub_workflows: None,
        };
        Harness {
            store,
            script,
            runner,
            ctx,
        }
    }

    #[tokio::test]
    async fn test_success_resolves_inputs_and_logs() {
        let h = harness(&[agent("calc", AgentType::Data)]).await;
        let step = WorkflowStep::agent("a", "calc").with_inputs(json!({ "n": "{{input.n}}" }));

        let run = h.runner.run(&step, &h.ctx, &CancellationToken::new()).await;
        assert_eq!(run.disposition, Disposition::Succeeded);
        assert_eq!(run.attempts, 1);
        assert_eq!(h.script.calls()[0].inputs["n"], json!(2));

        let logs = h.store.list_execution_logs(h.ctx.trace.id()).await.unwrap();
        assert!(logs.iter().all(|l| l.step_key.as_deref() == Some("a") && l.attempt == Some(1)));
        assert!(logs.iter().any(|l| l.message == "executor metrics"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_produce_one_record_per_attempt() {
        let h = harness(&[agent("flaky", AgentType::Api)]).await;
        h.script
            .set_default("flaky", MockOutcome::Fail(ExecutorError::Network("down".into())));
        let step = WorkflowStep::agent("a", "flaky").with_retry(2, 100);

        let run = h.runner.run(&step, &h.ctx, &CancellationToken::new()).await;
        assert_eq!(run.disposition, Disposition::Fatal);
        assert_eq!(run.attempts, 3);
        assert!(run.error.unwrap().contains("after 3 attempt(s)"));

        let records = h.ctx.trace.step_records().await;
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.status == StepStatus::Failed));
        assert_eq!(records.iter().map(|r| r.attempt).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_continue() {
        let h = harness(&[agent("slow", AgentType::Code)]).await;
        h.script.set_default("slow", MockOutcome::Hang);
        let step = WorkflowStep::agent("a", "slow")
            .with_timeout_ms(50)
            .with_on_error(OnError::Continue);

        let run = h.runner.run(&step, &h.ctx, &CancellationToken::new()).await;
        assert_eq!(run.disposition, Disposition::Tolerated);
        assert!(run.error.unwrap().contains("timed out after 50ms"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_attempt_does_not_retry() {
        let h = harness(&[agent("slow", AgentType::Code)]).await;
        h.script.set_default("slow", MockOutcome::Hang);
        let step = WorkflowStep::agent("a", "slow").with_retry(3, 0);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let run = h.runner.run(&step, &h.ctx, &cancel).await;
        assert_eq!(run.disposition, Disposition::Cancelled);
        assert_eq!(h.script.calls_for("a"), 1);
        let records = h.ctx.trace.step_records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, StepStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_missing_agent_fails_the_attempt() {
        let h = harness(&[]).await;
        let step = WorkflowStep::agent("a", "ghost");
        let run = h.runner.run(&step, &h.ctx, &CancellationToken::new()).await;
        assert_eq!(run.disposition, Disposition::Fatal);
        assert!(run.error.unwrap().contains("ghost"));
    }
}
