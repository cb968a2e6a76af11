//! Control steps: CONDITION, LOOP, PARALLEL, and WAIT.
//!
//! Each control step writes its own single attempt record. LOOP and
//! PARALLEL drive their AGENT children through the [`StepRunner`] and
//! settle each child's final state on the trace.

use std::collections::HashMap;
use std::time::Duration;

use futures::stream::{self, FuturesUnordered, StreamExt};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use maestro_core::template::resolve_value;
use maestro_core::types::*;

use crate::condition::Expr;
use crate::control::{ConditionConfig, LoopConfig, ParallelConfig, WaitConfig};
use crate::graph::StepGraph;
use crate::runner::{Disposition, StepContext, StepRun, StepRunner};

/// A finished step plus the steps its result rules out.
#[derive(Debug)]
pub struct StepOutcome {
    pub run: StepRun,
    /// Branch steps to mark SKIPPED.
    pub skip: Vec<String>,
}

impl From<StepRun> for StepOutcome {
    fn from(run: StepRun) -> Self {
        Self { run, skip: vec![] }
    }
}

async fn fail_control(ctx: &StepContext, step: &WorkflowStep, record: StepExecutionRecord, error: String) -> StepRun {
    ctx.trace.record_attempt(record.fail(error.clone())).await;
    ctx.trace
        .log(LogLevel::Error, Some(&step.step_key), Some(1), error.clone())
        .await;
    StepRun::failed(step, 1, error)
}

pub async fn run_condition(
    step: &WorkflowStep,
    config: &ConditionConfig,
    expr: &Expr,
    ctx: &StepContext,
) -> StepOutcome {
    let record = ctx.attempt_record(&step.step_key, 1);
    ctx.trace.record_attempt(record.clone()).await;

    let mut scope = ctx.scope.clone();
    if let Value::Object(map) = &mut scope {
        map.insert("inputs".into(), Value::Object(ctx.resolve_inputs(step)));
    }

    match expr.evaluate(&scope) {
        Ok(result) => {
            let (taken, other) = if result {
                (&config.true_branch, &config.false_branch)
            } else {
                (&config.false_branch, &config.true_branch)
            };
            let output = json!({
                "result": result,
                "branch": if result { "true" } else { "false" },
                "taken": taken,
            });
            ctx.trace.record_attempt(record.complete(output.clone())).await;
            ctx.trace
                .log(
                    LogLevel::Info,
                    Some(&step.step_key),
                    Some(1),
                    format!("'{}' evaluated to {}", config.expression, result),
                )
                .await;
            StepOutcome {
                run: StepRun::succeeded(&step.step_key, 1, output),
                skip: other.clone(),
            }
        }
        Err(e) => {
            let error = format!("condition '{}' failed: {}", config.expression, e);
            let run = fail_control(ctx, step, record, error).await;
            // A tolerated failure routes to neither branch.
            let skip = if run.disposition == Disposition::Tolerated {
                config
                    .true_branch
                    .iter()
                    .chain(&config.false_branch)
                    .cloned()
                    .collect()
            } else {
                vec![]
            };
            StepOutcome { run, skip }
        }
    }
}

pub async fn run_wait(
    step: &WorkflowStep,
    config: &WaitConfig,
    ctx: &StepContext,
    cancel: &CancellationToken,
) -> StepRun {
    let record = ctx.attempt_record(&step.step_key, 1);
    ctx.trace.record_attempt(record.clone()).await;

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            ctx.trace.record_attempt(record.cancel()).await;
            StepRun::cancelled(&step.step_key, 1)
        }
        _ = tokio::time::sleep(Duration::from_millis(config.duration_ms)) => {
            let output = json!({ "waitedMs": config.duration_ms });
            ctx.trace.record_attempt(record.complete(output.clone())).await;
            StepRun::succeeded(&step.step_key, 1, output)
        }
    }
}

/// Worst-so-far aggregate of one LOOP child across iterations.
fn merge_status(current: Option<(StepStatus, u32)>, run: &StepRun) -> (StepStatus, u32) {
    fn rank(status: StepStatus) -> u8 {
        match status {
            StepStatus::Failed => 3,
            StepStatus::Cancelled => 2,
            StepStatus::Completed => 1,
            _ => 0,
        }
    }
    match current {
        None => (run.status, run.attempts),
        Some((status, attempts)) => {
            let status = if rank(run.status) > rank(status) {
                run.status
            } else {
                status
            };
            (status, attempts.max(run.attempts))
        }
    }
}

async fn run_iteration(
    runner: &StepRunner,
    children: &[&WorkflowStep],
    config: &LoopConfig,
    ctx: &StepContext,
    index: usize,
    item: Value,
    cancel: &CancellationToken,
) -> (Map<String, Value>, Vec<StepRun>) {
    let mut scope = ctx.scope.clone();
    if let Value::Object(map) = &mut scope {
        map.insert(config.item_var.clone(), item.clone());
        map.insert("loop".into(), json!({ "item": item, "index": index }));
    }

    let mut outputs = Map::new();
    let mut runs = Vec::with_capacity(children.len());
    for child in children {
        if cancel.is_cancelled() {
            break;
        }
        let child_ctx = StepContext {
            scope: scope.clone(),
            iteration: Some(index),
            ..ctx.clone()
        };
        let run = runner.run(child, &child_ctx, cancel).await;
        if let Some(output) = &run.output {
            outputs.insert(child.step_key.clone(), output.clone());
            // Later children of the same iteration can read earlier ones.
            if let Some(steps) = scope.get_mut("steps").and_then(Value::as_object_mut) {
                steps.insert(child.step_key.clone(), output.clone());
            }
        }
        let fatal = run.disposition == Disposition::Fatal;
        runs.push(run);
        if fatal {
            break;
        }
    }
    (outputs, runs)
}

pub async fn run_loop(
    runner: &StepRunner,
    graph: &StepGraph,
    step: &WorkflowStep,
    config: &LoopConfig,
    ctx: &StepContext,
    cancel: &CancellationToken,
) -> StepRun {
    let record = ctx.attempt_record(&step.step_key, 1);
    ctx.trace.record_attempt(record.clone()).await;

    let items = match resolve_value(&config.items, &ctx.scope) {
        Value::Array(items) => items,
        other => {
            for key in &config.children {
                ctx.trace.finish_step(key, StepStatus::Skipped, 0).await;
            }
            let error = format!("loop items resolved to {}, expected an array", other);
            return fail_control(ctx, step, record, error).await;
        }
    };
    info!(
        execution_id = %ctx.trace.id(),
        step_key = %step.step_key,
        items = items.len(),
        concurrency = config.concurrency,
        "Loop started"
    );

    let children: Vec<&WorkflowStep> = config.children.iter().filter_map(|k| graph.step(k)).collect();
    let loop_token = cancel.child_token();
    let mut aggregate: HashMap<String, (StepStatus, u32)> = HashMap::new();
    let mut results = Vec::with_capacity(items.len());
    let mut first_error: Option<String> = None;

    {
        let (children, token) = (children.as_slice(), &loop_token);
        let mut iterations = stream::iter(items.into_iter().enumerate())
            .map(move |(index, item)| run_iteration(runner, children, config, ctx, index, item, token))
            .buffered(config.concurrency);

        while let Some((outputs, runs)) = iterations.next().await {
            for run in runs {
                let merged = merge_status(aggregate.get(&run.step_key).copied(), &run);
                aggregate.insert(run.step_key.clone(), merged);
                if run.disposition == Disposition::Fatal && first_error.is_none() {
                    first_error = run.error.clone();
                    loop_token.cancel();
                }
            }
            results.push(Value::Object(outputs));
        }
    }

    for key in &config.children {
        let (status, attempts) = aggregate
            .get(key)
            .copied()
            .unwrap_or((StepStatus::Skipped, 0));
        ctx.trace.finish_step(key, status, attempts).await;
    }

    if cancel.is_cancelled() {
        ctx.trace.record_attempt(record.cancel()).await;
        return StepRun::cancelled(&step.step_key, 1);
    }
    if let Some(error) = first_error {
        return fail_control(ctx, step, record, format!("loop iteration failed: {}", error)).await;
    }

    let output = Value::Array(results);
    debug!(step_key = %step.step_key, "Loop finished");
    ctx.trace.record_attempt(record.complete(output.clone())).await;
    StepRun::succeeded(&step.step_key, 1, output)
}

pub async fn run_parallel(
    runner: &StepRunner,
    graph: &StepGraph,
    step: &WorkflowStep,
    config: &ParallelConfig,
    ctx: &StepContext,
    cancel: &CancellationToken,
) -> StepRun {
    let record = ctx.attempt_record(&step.step_key, 1);
    ctx.trace.record_attempt(record.clone()).await;

    let fan_out = cancel.child_token();
    let mut outputs = Map::new();
    let mut first_error: Option<String> = None;

    {
        let token = &fan_out;
        let mut pending: FuturesUnordered<_> = config
            .children
            .iter()
            .filter_map(|k| graph.step(k))
            .map(move |child| async move { runner.run(child, ctx, token).await })
            .collect();

        while let Some(run) = pending.next().await {
            let key = run.step_key.clone();
            match run.disposition {
                Disposition::Succeeded => {
                    let output = run.output.clone().unwrap_or(Value::Null);
                    ctx.trace.set_step_output(&key, output.clone()).await;
                    outputs.insert(key.clone(), output);
                }
                Disposition::Tolerated => {
                    outputs.insert(key.clone(), Value::Null);
                }
                Disposition::Fatal => {
                    if first_error.is_none() {
                        first_error = Some(format!(
                            "child '{}' failed: {}",
                            key,
                            run.error.as_deref().unwrap_or("unknown error")
                        ));
                        // Siblings still running end CANCELLED.
                        fan_out.cancel();
                    }
                }
                Disposition::Cancelled => {}
            }
            ctx.trace.finish_step(&key, run.status, run.attempts).await;
        }
    }

    if let Some(error) = first_error {
        return fail_control(ctx, step, record, error).await;
    }
    if cancel.is_cancelled() {
        ctx.trace.record_attempt(record.cancel()).await;
        return StepRun::cancelled(&step.step_key, 1);
    }
    let output = Value::Object(outputs);
    ctx.trace.record_attempt(record.complete(output.clone())).await;
    StepRun::succeeded(&step.step_key, 1, output)
}
