use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Map, Value};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use maestro_core::config::EngineConfig;
use maestro_core::error::{MaestroError, Result};
use maestro_core::event::EventBus;
use maestro_core::traits::{ExecutionStore, SubWorkflowRequest, SubWorkflowRunner, WorkflowStore};
use maestro_core::types::*;

use crate::control::StepSpec;
use crate::flow::{self, StepOutcome};
use crate::graph::StepGraph;
use crate::runner::{Disposition, StepContext, StepRun, StepRunner};
use crate::trace::ExecutionTrace;

/// How long in-flight steps get to observe cancellation before their tasks
/// are aborted.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Per-call execution options.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub trigger: TriggerType,
    /// Overrides `engine.execution_timeout_ms`.
    pub timeout_ms: Option<u64>,
    pub parent_execution_id: Option<ExecutionId>,
    pub depth: u32,
    /// Parent token; the execution is cancelled when it fires.
    pub cancel: Option<CancellationToken>,
}

impl ExecuteOptions {
    pub fn trigger(trigger: TriggerType) -> Self {
        Self {
            trigger,
            ..Default::default()
        }
    }
}

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelOutcome {
    /// Whether this request moved the execution to CANCELLED.
    pub cancelled: bool,
    /// Status after the request.
    pub status: ExecutionStatus,
}

impl CancelOutcome {
    /// Fail with `NotCancellable` unless this request did the cancelling.
    pub fn require_cancelled(self, id: &ExecutionId) -> Result<ExecutionStatus> {
        if self.cancelled {
            Ok(self.status)
        } else {
            Err(MaestroError::NotCancellable {
                id: id.to_string(),
                status: self.status,
            })
        }
    }
}

#[derive(Clone)]
struct ActiveExecution {
    trace: Arc<ExecutionTrace>,
    cancel: CancellationToken,
}

struct Prepared {
    trace: Arc<ExecutionTrace>,
    graph: Arc<StepGraph>,
    cancel: CancellationToken,
    workflow_id: String,
    input: Value,
    timeout_ms: u64,
    depth: u32,
}

/// Bookkeeping for one drive loop.
#[derive(Default)]
struct DriveState {
    started: HashSet<String>,
    /// COMPLETED or SKIPPED; both unblock dependents.
    satisfied: HashSet<String>,
    tolerated: HashSet<String>,
    skipped: HashSet<String>,
}

impl DriveState {
    fn mark_skipped(&mut self, key: &str) {
        self.started.insert(key.to_string());
        self.satisfied.insert(key.to_string());
        self.skipped.insert(key.to_string());
    }
}

/// Owns running executions and drives each one through its step graph.
pub struct Scheduler {
    me: Weak<Scheduler>,
    workflows: Arc<dyn WorkflowStore>,
    store: Arc<dyn ExecutionStore>,
    events: Arc<EventBus>,
    runner: StepRunner,
    config: EngineConfig,
    active: Mutex<HashMap<ExecutionId, ActiveExecution>>,
}

impl Scheduler {
    pub fn new(
        config: EngineConfig,
        workflows: Arc<dyn WorkflowStore>,
        store: Arc<dyn ExecutionStore>,
        events: Arc<EventBus>,
        runner: StepRunner,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            workflows,
            store,
            events,
            runner,
            config,
            active: Mutex::new(HashMap::new()),
        })
    }

    fn active(&self) -> std::sync::MutexGuard<'_, HashMap<ExecutionId, ActiveExecution>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run a workflow to a terminal state.
    pub async fn execute(self: &Arc<Self>, workflow_id: &str, input: Value, options: ExecuteOptions) -> Result<Execution> {
        let run = self.prepare(workflow_id, input, options).await?;
        let started = run.trace.start().await;
        Ok(self.clone().complete(run, started).await)
    }

    /// Start a workflow and return as soon as it is RUNNING.
    pub async fn submit(self: &Arc<Self>, workflow_id: &str, input: Value, options: ExecuteOptions) -> Result<Execution> {
        let run = self.prepare(workflow_id, input, options).await?;
        let started = run.trace.start().await;
        let snapshot = run.trace.snapshot().await;
        tokio::spawn(self.clone().complete(run, started));
        Ok(snapshot)
    }

    async fn prepare(&self, workflow_id: &str, input: Value, options: ExecuteOptions) -> Result<Prepared> {
        let workflow = self
            .workflows
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| MaestroError::NotFound(format!("workflow '{}'", workflow_id)))?;
        if matches!(workflow.status, WorkflowStatus::Paused | WorkflowStatus::Archived) {
            return Err(MaestroError::Config(format!(
                "workflow '{}' is {:?} and cannot be executed",
                workflow.id, workflow.status
            )));
        }

        let graph = StepGraph::build(&workflow.steps)?;
        let mut execution = Execution::new(&workflow.id, options.trigger, input.clone(), graph.len() as u32);
        execution.parent_execution_id = options.parent_execution_id;

        let trace = Arc::new(ExecutionTrace::create(execution, self.store.clone(), self.events.clone()).await?);
        let cancel = options.cancel.map(|p| p.child_token()).unwrap_or_default();
        self.active().insert(
            trace.id().clone(),
            ActiveExecution {
                trace: trace.clone(),
                cancel: cancel.clone(),
            },
        );

        Ok(Prepared {
            trace,
            graph: Arc::new(graph),
            cancel,
            workflow_id: workflow.id,
            input,
            timeout_ms: options.timeout_ms.unwrap_or(self.config.execution_timeout_ms),
            depth: options.depth,
        })
    }

    async fn complete(self: Arc<Self>, run: Prepared, started: bool) -> Execution {
        if started {
            self.drive(&run).await;
        } else {
            // Cancelled while PENDING.
            run.trace.close_out(&step_keys(&run.graph)).await;
        }
        self.active().remove(run.trace.id());
        run.trace.snapshot().await
    }

    async fn drive(self: &Arc<Self>, run: &Prepared) {
        let trace = &run.trace;
        let graph = &run.graph;
        let deadline = Instant::now() + Duration::from_millis(run.timeout_ms);
        let steps_token = run.cancel.child_token();
        let max_in_flight = self.config.max_in_flight.max(1);

        let mut state = DriveState::default();
        let mut tasks: JoinSet<StepOutcome> = JoinSet::new();
        let mut failure: Option<String> = None;
        let mut interrupted: Option<ExecutionStatus> = None;

        info!(
            execution_id = %trace.id(),
            workflow_id = %run.workflow_id,
            steps = graph.len(),
            depth = run.depth,
            "Execution started"
        );

        loop {
            for key in graph.skip_cascade(&state.skipped, &state.started) {
                trace.finish_step(&key, StepStatus::Skipped, 0).await;
                state.mark_skipped(&key);
            }

            let mut ready: Vec<String> = graph
                .ready_set(&state.satisfied, &state.tolerated, &state.started)
                .into_iter()
                .collect();
            ready.sort_by_key(|k| (graph.step(k).map(|s| s.position).unwrap_or(0), k.clone()));

            for key in ready {
                if tasks.len() >= max_in_flight {
                    break;
                }
                state.started.insert(key.clone());
                let steps = Value::Object(trace.outputs().await);
                let ctx = StepContext {
                    trace: trace.clone(),
                    workflow_id: run.workflow_id.clone(),
                    scope: json!({ "input": run.input, "steps": steps }),
                    iteration: None,
                    depth: run.depth,
                    sub_workflows: Some(self.clone() as Arc<dyn SubWorkflowRunner>),
                };
                let this = self.clone();
                let graph = graph.clone();
                let token = steps_token.child_token();
                debug!(execution_id = %trace.id(), step_key = %key, "Launching step");
                tasks.spawn(async move {
                    let step = AssertUnwindSafe(this.run_step(&graph, &key, &ctx, &token));
                    match step.catch_unwind().await {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            error!(step_key = %key, "Step task panicked");
                            StepOutcome::from(StepRun {
                                step_key: key.clone(),
                                disposition: Disposition::Fatal,
                                status: StepStatus::Failed,
                                attempts: 1,
                                output: None,
                                error: Some(format!("step '{}' panicked", key)),
                            })
                        }
                    }
                });
            }

            if tasks.is_empty() {
                break;
            }

            let joined = tokio::select! {
                biased;
                _ = run.cancel.cancelled() => {
                    interrupted = Some(ExecutionStatus::Cancelled);
                    break;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    interrupted = Some(ExecutionStatus::Timeout);
                    break;
                }
                joined = tasks.join_next() => joined,
            };

            match joined {
                Some(Ok(outcome)) => {
                    if let Some(error) = settle(trace, &mut state, outcome).await {
                        failure = Some(error);
                        break;
                    }
                }
                Some(Err(e)) => warn!(execution_id = %trace.id(), error = %e, "Step task ended abnormally"),
                None => {}
            }
        }

        if failure.is_none() && interrupted.is_none() && run.cancel.is_cancelled() {
            interrupted = Some(ExecutionStatus::Cancelled);
        }

        if failure.is_some() || interrupted.is_some() {
            steps_token.cancel();
            let drained = tokio::time::timeout(CANCEL_GRACE, async {
                while let Some(joined) = tasks.join_next().await {
                    if let Ok(outcome) = joined {
                        settle(trace, &mut state, outcome).await;
                    }
                }
            })
            .await;
            if drained.is_err() {
                warn!(execution_id = %trace.id(), "In-flight steps ignored cancellation, aborting");
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
            }
        }

        trace.close_out(&step_keys(graph)).await;

        let (status, output, error) = match (failure, interrupted) {
            (Some(error), _) => (ExecutionStatus::Failed, None, Some(error)),
            (None, Some(ExecutionStatus::Timeout)) => (
                ExecutionStatus::Timeout,
                None,
                Some(format!("Execution exceeded {}ms", run.timeout_ms)),
            ),
            (None, Some(status)) => (status, None, Some("Execution cancelled".to_string())),
            (None, None) => {
                let output = sink_outputs(graph, trace.outputs().await);
                (ExecutionStatus::Completed, Some(output), None)
            }
        };

        if trace.finalize(status, output, error.clone()).await {
            let snapshot = trace.snapshot().await;
            info!(
                execution_id = %trace.id(),
                status = %status,
                steps_completed = snapshot.steps_completed,
                steps_failed = snapshot.steps_failed,
                error = error.as_deref().unwrap_or(""),
                "Execution finished"
            );
        }
    }

    async fn run_step(&self, graph: &StepGraph, key: &str, ctx: &StepContext, cancel: &CancellationToken) -> StepOutcome {
        let (Some(step), Some(spec)) = (graph.step(key), graph.spec(key)) else {
            return StepOutcome::from(StepRun {
                step_key: key.to_string(),
                disposition: Disposition::Fatal,
                status: StepStatus::Failed,
                attempts: 0,
                output: None,
                error: Some(format!("step '{}' is not part of the graph", key)),
            });
        };
        match spec {
            StepSpec::Agent => self.runner.run(step, ctx, cancel).await.into(),
            StepSpec::Condition { config, expr } => flow::run_condition(step, config, expr, ctx).await,
            StepSpec::Loop(config) => flow::run_loop(&self.runner, graph, step, config, ctx, cancel).await.into(),
            StepSpec::Parallel(config) => {
                flow::run_parallel(&self.runner, graph, step, config, ctx, cancel).await.into()
            }
            StepSpec::Wait(config) => flow::run_wait(step, config, ctx, cancel).await.into(),
        }
    }

    /// Cancel an execution. Idempotent: terminal executions report their
    /// status unchanged.
    pub async fn cancel(&self, id: &ExecutionId) -> Result<CancelOutcome> {
        let active = self.active().get(id).cloned();
        if let Some(active) = active {
            let (cancelled, status) = active.trace.try_cancel().await;
            active.cancel.cancel();
            if cancelled {
                info!(execution_id = %id, "Execution cancelled");
            }
            return Ok(CancelOutcome { cancelled, status });
        }

        let mut execution = self
            .store
            .get_execution(id)
            .await?
            .ok_or_else(|| MaestroError::NotFound(format!("execution '{}'", id)))?;
        if execution.status.is_terminal() {
            return Ok(CancelOutcome {
                cancelled: false,
                status: execution.status,
            });
        }

        // Not driven by this engine instance; only the stored row can change.
        warn!(execution_id = %id, status = %execution.status, "Cancelling execution not owned by this engine");
        execution.status = ExecutionStatus::Cancelled;
        execution.error_message = Some("Execution cancelled".to_string());
        execution.completed_at = Some(Utc::now());
        self.store.persist_execution(&execution).await?;
        Ok(CancelOutcome {
            cancelled: true,
            status: ExecutionStatus::Cancelled,
        })
    }

    /// Live snapshot for running executions, stored state otherwise.
    pub async fn get(&self, id: &ExecutionId) -> Result<Execution> {
        let active = self.active().get(id).cloned();
        if let Some(active) = active {
            return Ok(active.trace.snapshot().await);
        }
        self.store
            .get_execution(id)
            .await?
            .ok_or_else(|| MaestroError::NotFound(format!("execution '{}'", id)))
    }

    /// Live trace of a running execution.
    pub fn trace(&self, id: &ExecutionId) -> Option<Arc<ExecutionTrace>> {
        self.active().get(id).map(|a| a.trace.clone())
    }

    pub fn active_count(&self) -> usize {
        self.active().len()
    }

    /// Cancel every running execution.
    pub async fn cancel_all(&self) {
        let ids: Vec<ExecutionId> = self.active().keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.cancel(&id).await {
                warn!(execution_id = %id, error = %e, "Failed to cancel execution");
            }
        }
    }
}

impl SubWorkflowRunner for Scheduler {
    fn run_workflow(&self, request: SubWorkflowRequest) -> BoxFuture<'_, Result<Execution>> {
        Box::pin(async move {
            if request.depth > self.config.max_nesting_depth {
                return Err(MaestroError::Config(format!(
                    "nesting depth {} exceeds the limit of {}",
                    request.depth, self.config.max_nesting_depth
                )));
            }
            let this = self
                .me
                .upgrade()
                .ok_or_else(|| MaestroError::Config("engine is shutting down".into()))?;

            let options = ExecuteOptions {
                trigger: TriggerType::Event,
                timeout_ms: None,
                parent_execution_id: Some(request.parent_execution_id),
                depth: request.depth,
                cancel: Some(request.cancel),
            };
            let run = this.prepare(&request.workflow_id, request.input, options).await?;
            let started = run.trace.start().await;
            // Spawned so the child still settles if the parent attempt is dropped.
            tokio::spawn(this.clone().complete(run, started))
                .await
                .map_err(|e| MaestroError::Config(format!("nested execution task failed: {}", e)))
        })
    }
}

/// Apply a finished step to the trace. Returns the error of a fatal step.
async fn settle(trace: &ExecutionTrace, state: &mut DriveState, outcome: StepOutcome) -> Option<String> {
    let StepOutcome { run, skip } = outcome;
    let key = run.step_key.clone();
    let mut fatal = None;

    match run.disposition {
        Disposition::Succeeded => {
            if let Some(output) = run.output {
                trace.set_step_output(&key, output).await;
            }
            trace.finish_step(&key, StepStatus::Completed, run.attempts).await;
            state.satisfied.insert(key.clone());
        }
        Disposition::Tolerated => {
            let error = run.error.unwrap_or_default();
            trace
                .log(
                    LogLevel::Warn,
                    Some(&key),
                    Some(run.attempts),
                    format!("continuing after failure: {}", error),
                )
                .await;
            trace.finish_step(&key, StepStatus::Failed, run.attempts).await;
            state.tolerated.insert(key.clone());
        }
        Disposition::Fatal => {
            trace.finish_step(&key, StepStatus::Failed, run.attempts).await;
            fatal = Some(run.error.unwrap_or_else(|| format!("step '{}' failed", key)));
        }
        Disposition::Cancelled => {
            trace.finish_step(&key, StepStatus::Cancelled, run.attempts).await;
        }
    }

    for branch in skip {
        trace.finish_step(&branch, StepStatus::Skipped, 0).await;
        state.mark_skipped(&branch);
    }
    fatal
}

fn step_keys(graph: &StepGraph) -> Vec<String> {
    graph.topological_order()
}

/// Outputs of completed top-level steps that nothing depends on.
fn sink_outputs(graph: &StepGraph, outputs: Map<String, Value>) -> Value {
    let sinks: Map<String, Value> = outputs
        .into_iter()
        .filter(|(key, _)| graph.owner(key).is_none() && graph.dependents(key).is_empty())
        .collect();
    Value::Object(sinks)
}
