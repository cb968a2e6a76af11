use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use maestro_core::config::EngineConfig;
use maestro_core::error::{ExecutorError, MaestroError, ValidationError};
use maestro_core::event::ExecutionEvent;
use maestro_core::traits::{AgentExecutor, LlmClient};
use maestro_core::types::*;
use maestro_engine::{ExecuteOptions, WorkflowEngine};
use maestro_executors::{ExecutorDeps, ExecutorRegistry, WorkflowExecutor};
use maestro_store::MemoryStore;
use maestro_test_utils::{agent, agent_step, workflow, MockLlmClient, MockOutcome, MockScript};

struct Harness {
    engine: WorkflowEngine,
    store: Arc<MemoryStore>,
    script: Arc<MockScript>,
}

/// Every agent type is served by the script, except WORKFLOW which runs
/// nested executions for real.
fn scripted_registry(script: &Arc<MockScript>) -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new(ExecutorDeps::default());
    for agent_type in AgentType::ALL {
        let script = script.clone();
        registry.register(
            agent_type,
            Arc::new(move |_: &ExecutorDeps| -> Box<dyn AgentExecutor> {
                Box::new(script.executor(agent_type))
            }),
        );
    }
    registry.register(
        AgentType::Workflow,
        Arc::new(|_: &ExecutorDeps| -> Box<dyn AgentExecutor> { Box::new(WorkflowExecutor::new()) }),
    );
    registry
}

fn harness_with(config: EngineConfig, workflows: &[Workflow], agents: &[Agent]) -> Harness {
    let store = Arc::new(MemoryStore::new());
    for wf in workflows {
        store.save_workflow(wf).unwrap();
    }
    for a in agents {
        store.save_agent(a).unwrap();
    }
    let script = MockScript::new();
    let engine = WorkflowEngine::new(config, store.clone(), store.clone(), scripted_registry(&script));
    Harness { engine, store, script }
}

fn harness(workflows: &[Workflow], agents: &[Agent]) -> Harness {
    harness_with(EngineConfig::default(), workflows, agents)
}

fn data(id: &str) -> Agent {
    agent(id, AgentType::Data)
}

fn fail(message: &str) -> MockOutcome {
    MockOutcome::Fail(ExecutorError::Network(message.to_string()))
}

impl Harness {
    async fn run(&self, workflow_id: &str, input: Value) -> Execution {
        self.engine
            .execute_workflow(workflow_id, TriggerType::Manual, input)
            .await
            .unwrap()
    }

    async fn records(&self, id: &ExecutionId, step_key: &str) -> Vec<StepExecutionRecord> {
        self.engine
            .list_step_records(id)
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.step_key == step_key)
            .collect()
    }

    async fn wait_until_settled(&self, id: &ExecutionId) {
        for _ in 0..200 {
            if self.engine.trace(id).is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("execution {} never settled", id);
    }
}

#[tokio::test]
async fn test_linear_workflow_completes_with_sink_output() {
    let h = harness(
        &[workflow(
            "wf",
            vec![
                agent_step("fetch", "reader", &[]).with_inputs(json!({ "n": "{{input.n}}" })),
                agent_step("shape", "reader", &["fetch"])
                    .with_inputs(json!({ "from": "{{steps.fetch.inputs.n}}" })),
            ],
        )],
        &[data("reader")],
    );

    let execution = h.run("wf", json!({ "n": 4 })).await;
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!((execution.steps_total, execution.steps_completed, execution.steps_failed), (2, 2, 0));
    assert!(execution.started_at.is_some() && execution.completed_at.is_some());

    let output = execution.output_data.unwrap();
    assert_eq!(output["shape"]["inputs"]["from"], json!(4));
    assert!(output.get("fetch").is_none());

    let stored = h.engine.get_execution(&execution.id).await.unwrap();
    assert_eq!(stored.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn test_single_failing_step_fails_execution() {
    let h = harness(&[workflow("wf", vec![agent_step("a", "broken", &[])])], &[data("broken")]);
    h.script.set_default("broken", fail("connection reset"));

    let execution = h.run("wf", json!({})).await;
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!((execution.steps_completed, execution.steps_failed), (0, 1));
    let error = execution.error_message.unwrap();
    assert!(error.contains("Step 'a' failed"), "{}", error);
    assert!(execution.output_data.is_none());
}

#[tokio::test]
async fn test_continue_lets_dependents_run() {
    let h = harness(
        &[workflow(
            "wf",
            vec![
                agent_step("a", "broken", &[]).with_on_error(OnError::Continue),
                agent_step("b", "ok", &["a"]),
            ],
        )],
        &[data("broken"), data("ok")],
    );
    h.script.set_default("broken", fail("boom"));

    let execution = h.run("wf", json!({})).await;
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!((execution.steps_completed, execution.steps_failed), (1, 1));
    assert_eq!(h.script.calls_for("b"), 1);

    let logs = h.engine.list_execution_logs(&execution.id).await.unwrap();
    assert!(logs
        .iter()
        .any(|l| l.level == LogLevel::Warn && l.step_key.as_deref() == Some("a")));
}

#[tokio::test]
async fn test_fatal_failure_skips_unstarted_dependents() {
    let h = harness(
        &[workflow(
            "wf",
            vec![agent_step("a", "broken", &[]), agent_step("b", "ok", &["a"])],
        )],
        &[data("broken"), data("ok")],
    );
    h.script.set_default("broken", fail("boom"));

    let execution = h.run("wf", json!({})).await;
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(h.script.calls_for("b"), 0);
    let b = h.records(&execution.id, "b").await;
    assert_eq!(b.len(), 1);
    assert_eq!(b[0].status, StepStatus::Skipped);
}

#[tokio::test]
async fn test_retries_write_one_record_per_attempt() {
    let h = harness(
        &[workflow("wf", vec![agent_step("a", "broken", &[]).with_retry(2, 0)])],
        &[data("broken")],
    );
    h.script.set_default("broken", fail("still down"));

    let execution = h.run("wf", json!({})).await;
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(h.script.calls_for("a"), 3);

    let records = h.records(&execution.id, "a").await;
    let attempts: Vec<u32> = records.iter().map(|r| r.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    assert!(records.iter().all(|r| r.status == StepStatus::Failed));
    assert!(execution.error_message.unwrap().contains("after 3 attempt"));
}

#[tokio::test]
async fn test_retry_recovers_after_transient_failure() {
    let h = harness(
        &[workflow("wf", vec![agent_step("a", "flaky", &[]).with_retry(1, 0)])],
        &[data("flaky")],
    );
    h.script.push("flaky", fail("blip"));

    let execution = h.run("wf", json!({})).await;
    assert_eq!(execution.status, ExecutionStatus::Completed);
    let records = h.records(&execution.id, "a").await;
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].status, StepStatus::Failed);
    assert_eq!(records[1].status, StepStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_parallel_failure_cancels_siblings() {
    let h = harness(
        &[workflow(
            "wf",
            vec![
                WorkflowStep::control("fan", StepType::Parallel).with_config(json!({ "children": ["x", "y"] })),
                agent_step("x", "flaky", &[]),
                agent_step("y", "slow", &[]),
            ],
        )],
        &[data("flaky"), data("slow")],
    );
    h.script.set_delay("flaky", Duration::from_millis(10));
    h.script.set_default("flaky", fail("boom"));
    h.script.set_default("slow", MockOutcome::Hang);

    let execution = h.run("wf", json!({})).await;
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.error_message.unwrap().contains("child 'x' failed"));

    let y = h.records(&execution.id, "y").await;
    assert_eq!(y.len(), 1);
    assert_eq!(y[0].status, StepStatus::Cancelled);
    assert!(y[0].completed_at.is_some());
    assert_eq!(h.records(&execution.id, "x").await[0].status, StepStatus::Failed);
    assert_eq!(execution.steps_completed, 0);
    assert_eq!(execution.steps_failed, 2);
}

#[tokio::test]
async fn test_parallel_collects_child_outputs() {
    let h = harness(
        &[workflow(
            "wf",
            vec![
                WorkflowStep::control("fan", StepType::Parallel).with_config(json!({ "children": ["x", "y"] })),
                agent_step("x", "ok", &[]).with_inputs(json!({ "side": "left" })),
                agent_step("y", "ok", &[]).with_inputs(json!({ "side": "right" })),
                agent_step("join", "ok", &["fan"]).with_inputs(json!({ "left": "{{steps.x.inputs.side}}" })),
            ],
        )],
        &[data("ok")],
    );

    let execution = h.run("wf", json!({})).await;
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.steps_completed, 4);
    let join = h.script.calls().into_iter().find(|c| c.step_key == "join").unwrap();
    assert_eq!(join.inputs["left"], json!("left"));
}

fn routing_workflow() -> Workflow {
    workflow(
        "route",
        vec![
            WorkflowStep::control("check", StepType::Condition).with_config(json!({
                "expression": "input.amount > 100",
                "trueBranch": ["big"],
                "falseBranch": ["small"],
            })),
            agent_step("big", "ok", &["check"]),
            agent_step("small", "ok", &["check"]),
            agent_step("notify", "ok", &["big", "small"]),
        ],
    )
}

#[tokio::test]
async fn test_condition_routes_to_one_branch() {
    let h = harness(&[routing_workflow()], &[data("ok")]);

    let execution = h.run("route", json!({ "amount": 150 })).await;
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(h.script.calls_for("big"), 1);
    assert_eq!(h.script.calls_for("small"), 0);
    assert_eq!(h.script.calls_for("notify"), 1);

    let small = h.records(&execution.id, "small").await;
    assert_eq!(small.len(), 1);
    assert_eq!(small[0].status, StepStatus::Skipped);
    assert!(small[0].started_at.is_none());

    let check = h.records(&execution.id, "check").await;
    assert_eq!(check[0].output.as_ref().unwrap()["branch"], json!("true"));
    assert_eq!((execution.steps_total, execution.steps_completed, execution.steps_failed), (4, 3, 0));
}

#[tokio::test]
async fn test_condition_false_branch() {
    let h = harness(&[routing_workflow()], &[data("ok")]);

    let execution = h.run("route", json!({ "amount": 20 })).await;
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(h.script.calls_for("big"), 0);
    assert_eq!(h.script.calls_for("small"), 1);
}

#[tokio::test]
async fn test_condition_type_error_fails_the_step() {
    let h = harness(&[routing_workflow()], &[data("ok")]);

    let execution = h.run("route", json!({ "amount": "lots" })).await;
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.error_message.unwrap().contains("condition"));
    assert!(h.script.calls().is_empty());
}

#[tokio::test]
async fn test_loop_runs_children_per_item() {
    let h = harness(
        &[workflow(
            "wf",
            vec![
                WorkflowStep::control("each", StepType::Loop).with_config(json!({
                    "items": "{{input.rows}}",
                    "children": ["send"],
                    "concurrency": 2,
                })),
                agent_step("send", "mailer", &[]).with_inputs(json!({ "row": "{{item}}", "at": "{{loop.index}}" })),
            ],
        )],
        &[data("mailer")],
    );

    let execution = h.run("wf", json!({ "rows": ["a", "b", "c"] })).await;
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(h.script.calls_for("send"), 3);

    let output = execution.output_data.unwrap();
    let rows = output["each"].as_array().unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[1]["send"]["inputs"]["row"], json!("b"));
    assert_eq!(rows[2]["send"]["inputs"]["at"], json!(2));

    let mut iterations: Vec<Option<usize>> = h
        .records(&execution.id, "send")
        .await
        .iter()
        .map(|r| r.iteration)
        .collect();
    iterations.sort();
    assert_eq!(iterations, vec![Some(0), Some(1), Some(2)]);
    assert_eq!(execution.steps_completed, 2);
}

#[tokio::test]
async fn test_loop_over_non_array_fails() {
    let h = harness(
        &[workflow(
            "wf",
            vec![
                WorkflowStep::control("each", StepType::Loop)
                    .with_config(json!({ "items": "{{input.rows}}", "children": ["send"] })),
                agent_step("send", "mailer", &[]),
            ],
        )],
        &[data("mailer")],
    );

    let execution = h.run("wf", json!({ "rows": 3 })).await;
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(h.records(&execution.id, "send").await[0].status, StepStatus::Skipped);
}

#[tokio::test(start_paused = true)]
async fn test_wait_step_delays_dependents() {
    let h = harness(
        &[workflow(
            "wf",
            vec![
                WorkflowStep::control("pause", StepType::Wait).with_config(json!({ "durationMs": 1000 })),
                agent_step("after", "ok", &["pause"]),
            ],
        )],
        &[data("ok")],
    );

    let started = tokio::time::Instant::now();
    let execution = h.run("wf", json!({})).await;
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert!(started.elapsed() >= Duration::from_millis(1000));
    let pause = h.records(&execution.id, "pause").await;
    assert_eq!(pause[0].output.as_ref().unwrap()["waitedMs"], json!(1000));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_is_idempotent() {
    let h = harness(&[workflow("wf", vec![agent_step("a", "slow", &[])])], &[data("slow")]);
    h.script.set_default("slow", MockOutcome::Hang);

    let running = h
        .engine
        .submit_workflow("wf", TriggerType::Manual, json!({}))
        .await
        .unwrap();
    assert_eq!(running.status, ExecutionStatus::Running);
    tokio::time::sleep(Duration::from_millis(10)).await;

    let first = h.engine.cancel_execution(&running.id).await.unwrap();
    assert!(first.cancelled);
    assert_eq!(first.status, ExecutionStatus::Cancelled);

    let second = h.engine.cancel_execution(&running.id).await.unwrap();
    assert!(!second.cancelled);
    assert_eq!(second.status, ExecutionStatus::Cancelled);
    assert!(matches!(
        second.require_cancelled(&running.id),
        Err(MaestroError::NotCancellable { .. })
    ));

    h.wait_until_settled(&running.id).await;
    let execution = h.engine.get_execution(&running.id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Cancelled);
    let records = h.records(&running.id, "a").await;
    assert_eq!(records[0].status, StepStatus::Cancelled);
}

#[tokio::test]
async fn test_cancel_unknown_execution_is_not_found() {
    let h = harness(&[], &[]);
    let result = h.engine.cancel_execution(&ExecutionId::from_string("nope")).await;
    assert!(matches!(result, Err(MaestroError::NotFound(_))));
}

#[tokio::test]
async fn test_cancel_finished_execution_reports_status() {
    let h = harness(&[workflow("wf", vec![agent_step("a", "ok", &[])])], &[data("ok")]);
    let execution = h.run("wf", json!({})).await;

    let outcome = h.engine.cancel_execution(&execution.id).await.unwrap();
    assert!(!outcome.cancelled);
    assert_eq!(outcome.status, ExecutionStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_execution_timeout() {
    let h = harness(&[workflow("wf", vec![agent_step("a", "slow", &[])])], &[data("slow")]);
    h.script.set_default("slow", MockOutcome::Hang);

    let options = ExecuteOptions {
        timeout_ms: Some(100),
        ..Default::default()
    };
    let execution = h.engine.execute_with("wf", json!({}), options).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Timeout);
    assert_eq!(execution.error_message.as_deref(), Some("Execution exceeded 100ms"));
    assert_eq!(h.records(&execution.id, "a").await[0].status, StepStatus::Cancelled);
}

#[tokio::test]
async fn test_counters_never_exceed_total() {
    let h = harness(
        &[workflow(
            "wf",
            vec![
                agent_step("a", "ok", &[]),
                agent_step("b", "broken", &[]).with_on_error(OnError::Continue),
                agent_step("c", "ok", &["a", "b"]),
                WorkflowStep::control("check", StepType::Condition)
                    .with_depends_on(&["c"])
                    .with_config(json!({ "expression": "input.go", "trueBranch": ["d"], "falseBranch": ["e"] })),
                agent_step("d", "ok", &["check"]),
                agent_step("e", "ok", &["check"]),
            ],
        )],
        &[data("ok"), data("broken")],
    );
    h.script.set_default("broken", fail("boom"));
    let mut rx = h.engine.events().subscribe();

    let execution = h.run("wf", json!({ "go": true })).await;
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!((execution.steps_total, execution.steps_completed, execution.steps_failed), (6, 4, 1));

    let mut finished: HashMap<String, u32> = HashMap::new();
    let (mut completed, mut failed) = (0, 0);
    while let Ok(event) = rx.try_recv() {
        if let ExecutionEvent::StepFinished { step_key, status, .. } = event {
            *finished.entry(step_key).or_default() += 1;
            match status {
                StepStatus::Completed => completed += 1,
                StepStatus::Failed => failed += 1,
                _ => {}
            }
            assert!(completed + failed <= execution.steps_total);
        }
    }
    assert_eq!(finished.len(), 6);
    assert!(finished.values().all(|n| *n == 1), "{:?}", finished);
}

#[tokio::test(start_paused = true)]
async fn test_agent_concurrency_limit() {
    let h = harness(
        &[workflow(
            "wf",
            vec![
                WorkflowStep::control("fan", StepType::Parallel)
                    .with_config(json!({ "children": ["x", "y", "z"] })),
                agent_step("x", "single", &[]),
                agent_step("y", "single", &[]),
                agent_step("z", "single", &[]),
            ],
        )],
        &[data("single").with_max_concurrent(1)],
    );
    h.script.set_delay("single", Duration::from_millis(20));

    let execution = h.run("wf", json!({})).await;
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(h.script.calls().len(), 3);
    assert_eq!(h.script.max_in_flight(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_max_in_flight_bounds_ready_steps() {
    let config = EngineConfig {
        max_in_flight: 2,
        ..Default::default()
    };
    let steps = ["a", "b", "c", "d"].iter().map(|k| agent_step(k, "wide", &[])).collect();
    let h = harness_with(config, &[workflow("wf", steps)], &[data("wide").with_max_concurrent(10)]);
    h.script.set_delay("wide", Duration::from_millis(20));

    let execution = h.run("wf", json!({})).await;
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(h.script.max_in_flight(), 2);
}

fn nested_workflows() -> Vec<Workflow> {
    vec![
        workflow(
            "parent",
            vec![agent_step("call", "sub", &[]).with_inputs(json!({ "x": "{{input.x}}" }))],
        ),
        workflow(
            "child",
            vec![agent_step("work", "worker", &[]).with_inputs(json!({ "x": "{{input.x}}" }))],
        ),
    ]
}

fn nested_agents() -> Vec<Agent> {
    vec![
        agent("sub", AgentType::Workflow).with_config(json!({ "workflowId": "child" })),
        data("worker"),
    ]
}

#[tokio::test]
async fn test_nested_workflow_runs_child_execution() {
    let h = harness(&nested_workflows(), &nested_agents());

    let parent = h.run("parent", json!({ "x": 5 })).await;
    assert_eq!(parent.status, ExecutionStatus::Completed);
    let call = &parent.output_data.unwrap()["call"];
    assert_eq!(call["status"], json!("COMPLETED"));
    assert_eq!(call["output"]["work"]["inputs"]["x"], json!(5));

    let children = h.engine.list_executions("child").await.unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].parent_execution_id.as_ref(), Some(&parent.id));
    assert_eq!(children[0].trigger_type, TriggerType::Event);
}

#[tokio::test]
async fn test_nesting_depth_limit() {
    let config = EngineConfig {
        max_nesting_depth: 0,
        ..Default::default()
    };
    let h = harness_with(config, &nested_workflows(), &nested_agents());

    let parent = h.run("parent", json!({ "x": 5 })).await;
    assert_eq!(parent.status, ExecutionStatus::Failed);
    assert!(parent.error_message.unwrap().contains("nesting depth"));
    assert!(h.engine.list_executions("child").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_graph_rejected_before_execution() {
    let h = harness(
        &[workflow(
            "wf",
            vec![agent_step("a", "ok", &["b"]), agent_step("b", "ok", &["a"])],
        )],
        &[data("ok")],
    );

    let result = h.engine.execute_workflow("wf", TriggerType::Manual, json!({})).await;
    assert!(matches!(
        result,
        Err(MaestroError::Validation(ValidationError::Cycle { .. }))
    ));
    assert!(h.engine.list_executions("wf").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_and_paused_workflows() {
    let mut paused = workflow("held", vec![agent_step("a", "ok", &[])]);
    paused.status = WorkflowStatus::Paused;
    let h = harness(&[paused], &[data("ok")]);

    let missing = h.engine.execute_workflow("nope", TriggerType::Manual, json!({})).await;
    assert!(matches!(missing, Err(MaestroError::NotFound(_))));
    let held = h.engine.execute_workflow("held", TriggerType::Manual, json!({})).await;
    assert!(matches!(held, Err(MaestroError::Config(_))));
}

#[tokio::test]
async fn test_activate_requires_known_agents() {
    let mut draft = workflow("wf", vec![agent_step("a", "ghost", &[])]);
    draft.status = WorkflowStatus::Draft;
    let h = harness(&[draft], &[]);

    let result = h.engine.activate_workflow("wf").await;
    assert!(matches!(result, Err(MaestroError::NotFound(_))));

    h.store.save_agent(&data("ghost")).unwrap();
    let active = h.engine.activate_workflow("wf").await.unwrap();
    assert_eq!(active.status, WorkflowStatus::Active);
}

#[tokio::test]
async fn test_llm_non_json_reply_completes_with_warning() {
    let store = Arc::new(MemoryStore::new());
    store
        .save_workflow(&workflow(
            "wf",
            vec![agent_step("rate", "judge", &[]).with_inputs(json!({ "prompt": "rate this" }))],
        ))
        .unwrap();
    store
        .save_agent(&agent("judge", AgentType::Llm).with_config(json!({
            "provider": "openai",
            "model": "m",
            "responseFormat": "json_object",
        })))
        .unwrap();
    let client: Arc<dyn LlmClient> = Arc::new(MockLlmClient::new("openai").with_reply("probably a 7"));
    let deps = ExecutorDeps {
        llm_clients: HashMap::from([("openai".to_string(), client)]),
        ..ExecutorDeps::default()
    };
    let engine = WorkflowEngine::new(
        EngineConfig::default(),
        store.clone(),
        store.clone(),
        ExecutorRegistry::with_builtins(deps),
    );

    let execution = engine
        .execute_workflow("wf", TriggerType::Api, json!({}))
        .await
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    let output = &execution.output_data.unwrap()["rate"];
    assert_eq!(output["content"], json!("probably a 7"));
    assert!(output.get("parsedJson").is_none());

    let logs = engine.list_execution_logs(&execution.id).await.unwrap();
    let warning = logs
        .iter()
        .find(|l| l.level == LogLevel::Warn)
        .expect("json warning logged");
    assert_eq!(warning.step_key.as_deref(), Some("rate"));
    assert_eq!(warning.attempt, Some(1));
}
