//! Mocks and fixtures shared by the Maestro test suites.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use maestro_core::config::CapabilityServerConfig;
use maestro_core::error::{CapabilityError, ExecutorError};
use maestro_core::traits::{AgentExecutor, CapabilityConnector, CapabilityTransport, ExecutorInput, LlmClient};
use maestro_core::types::*;

// ── Executors ───────────────────────────────────────────────────

/// What a scripted agent does on one call.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    Succeed(Value),
    Fail(ExecutorError),
    /// Block until the step is cancelled.
    Hang,
}

/// One recorded executor call.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub agent_id: String,
    pub step_key: String,
    pub attempt: u32,
    pub inputs: JsonMap,
}

/// Shared script driving every [`MockExecutor`] created from it.
///
/// Outcomes are keyed by agent id. Queued outcomes are consumed first, then
/// the agent's default, then a success echoing the inputs.
#[derive(Default)]
pub struct MockScript {
    queued: Mutex<HashMap<String, VecDeque<MockOutcome>>>,
    defaults: Mutex<HashMap<String, MockOutcome>>,
    delays: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<MockCall>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockScript {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, agent_id: &str, outcome: MockOutcome) {
        self.queued
            .lock()
            .unwrap()
            .entry(agent_id.to_string())
            .or_default()
            .push_back(outcome);
    }

    pub fn set_default(&self, agent_id: &str, outcome: MockOutcome) {
        self.defaults
            .lock()
            .unwrap()
            .insert(agent_id.to_string(), outcome);
    }

    pub fn set_delay(&self, agent_id: &str, delay: Duration) {
        self.delays
            .lock()
            .unwrap()
            .insert(agent_id.to_string(), delay);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, step_key: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.step_key == step_key)
            .count()
    }

    /// Highest number of concurrently running calls seen so far.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn executor(self: &Arc<Self>, agent_type: AgentType) -> MockExecutor {
        MockExecutor {
            agent_type,
            script: self.clone(),
            metrics: None,
        }
    }

    fn next_outcome(&self, agent_id: &str, inputs: &JsonMap) -> MockOutcome {
        if let Some(outcome) = self
            .queued
            .lock()
            .unwrap()
            .get_mut(agent_id)
            .and_then(|q| q.pop_front())
        {
            return outcome;
        }
        if let Some(outcome) = self.defaults.lock().unwrap().get(agent_id) {
            return outcome.clone();
        }
        MockOutcome::Succeed(json!({ "agentId": agent_id, "inputs": inputs }))
    }

    fn delay(&self, agent_id: &str) -> Option<Duration> {
        self.delays.lock().unwrap().get(agent_id).copied()
    }
}

struct InFlightGuard<'a>(&'a MockScript);

impl<'a> InFlightGuard<'a> {
    fn enter(script: &'a MockScript) -> Self {
        let now = script.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        script.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(script)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Executor whose behavior comes from a [`MockScript`].
pub struct MockExecutor {
    agent_type: AgentType,
    script: Arc<MockScript>,
    metrics: Option<ExecutionMetrics>,
}

impl AgentExecutor for MockExecutor {
    fn agent_type(&self) -> AgentType {
        self.agent_type
    }

    fn execute(
        &mut self,
        input: ExecutorInput,
    ) -> BoxFuture<'_, Result<ExecutionResult, ExecutorError>> {
        Box::pin(async move {
            let script = self.script.clone();
            let agent_id = input.agent.id.clone();
            script.calls.lock().unwrap().push(MockCall {
                agent_id: agent_id.clone(),
                step_key: input.context.step_key.clone(),
                attempt: input.context.attempt,
                inputs: input.inputs.clone(),
            });
            let _guard = InFlightGuard::enter(&script);
            let started = tokio::time::Instant::now();

            if let Some(delay) = script.delay(&agent_id) {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = input.context.cancel.cancelled() => return Err(ExecutorError::Cancelled),
                }
            }

            let outcome = script.next_outcome(&agent_id, &input.inputs);
            self.metrics = Some(ExecutionMetrics {
                duration_ms: started.elapsed().as_millis() as u64,
                api_calls: 1,
                ..Default::default()
            });
            match outcome {
                MockOutcome::Succeed(output) => Ok(ExecutionResult::new(output)
                    .with_log(ExecutorLog::info(format!("mock agent {} ran", agent_id)))),
                MockOutcome::Fail(err) => Err(err),
                MockOutcome::Hang => {
                    input.context.cancel.cancelled().await;
                    Err(ExecutorError::Cancelled)
                }
            }
        })
    }

    fn collect_metrics(&self) -> Option<ExecutionMetrics> {
        self.metrics.clone()
    }
}

// ── LLM ─────────────────────────────────────────────────────────

/// Scripted LLM client that records every request.
pub struct MockLlmClient {
    provider: String,
    replies: Mutex<VecDeque<Result<ChatResponse, ExecutorError>>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl MockLlmClient {
    pub fn new(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            replies: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_reply(self, content: &str) -> Self {
        self.push_reply(content);
        self
    }

    pub fn push_reply(&self, content: &str) {
        self.replies
            .lock()
            .unwrap()
            .push_back(Ok(chat_response(content, TokenUsage::new(12, 8))));
    }

    pub fn push_error(&self, err: ExecutorError) {
        self.replies.lock().unwrap().push_back(Err(err));
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl LlmClient for MockLlmClient {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn chat(&self, request: ChatRequest) -> BoxFuture<'_, Result<ChatResponse, ExecutorError>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(request);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(chat_response("ok", TokenUsage::new(1, 1))))
        })
    }
}

pub fn chat_response(content: &str, usage: TokenUsage) -> ChatResponse {
    ChatResponse {
        content: content.to_string(),
        model: "mock-model".to_string(),
        usage,
        finish_reason: Some("stop".to_string()),
    }
}

// ── Capabilities ────────────────────────────────────────────────

/// In-process capability transport. Echoes calls unless told to fail.
pub struct MockTransport {
    response: Mutex<Option<Value>>,
    pending_failures: Mutex<VecDeque<String>>,
    calls: AtomicU32,
    closed: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            response: Mutex::new(None),
            pending_failures: Mutex::new(VecDeque::new()),
            calls: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_response(self, value: Value) -> Self {
        *self.response.lock().unwrap() = Some(value);
        self
    }

    /// Fail the next `n` calls with `message`.
    pub fn fail_next(&self, n: usize, message: &str) {
        let mut pending = self.pending_failures.lock().unwrap();
        for _ in 0..n {
            pending.push_back(message.to_string());
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityTransport for MockTransport {
    fn call(&self, capability: String, params: Value) -> BoxFuture<'_, Result<Value, String>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(message) = self.pending_failures.lock().unwrap().pop_front() {
                return Err(message);
            }
            Ok(self
                .response
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| json!({ "capability": capability, "params": params })))
        })
    }

    fn ping(&self) -> BoxFuture<'_, Result<(), String>> {
        Box::pin(async move {
            if self.is_closed() {
                Err("closed".to_string())
            } else {
                Ok(())
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
        })
    }
}

/// Connector that hands out the same [`MockTransport`] for every server.
pub struct MockConnector {
    transport: Arc<MockTransport>,
    refuse: Option<String>,
    refusals_left: AtomicU32,
    delay: Option<Duration>,
    connects: AtomicU32,
}

impl MockConnector {
    pub fn new(transport: Arc<MockTransport>) -> Self {
        Self {
            transport,
            refuse: None,
            refusals_left: AtomicU32::new(0),
            delay: None,
            connects: AtomicU32::new(0),
        }
    }

    /// A connector whose every connect attempt fails.
    pub fn refusing(message: &str) -> Self {
        Self::refusing_first(u32::MAX, message, Arc::new(MockTransport::new()))
    }

    /// Fail the first `n` connect attempts with `message`, then hand out
    /// `transport`.
    pub fn refusing_first(n: u32, message: &str, transport: Arc<MockTransport>) -> Self {
        Self {
            refuse: Some(message.to_string()),
            refusals_left: AtomicU32::new(n),
            ..Self::new(transport)
        }
    }

    /// Sleep for `delay` before every connect.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }
}

impl CapabilityConnector for MockConnector {
    fn connect(
        &self,
        _server: String,
        _config: CapabilityServerConfig,
    ) -> BoxFuture<'_, Result<Arc<dyn CapabilityTransport>, CapabilityError>> {
        Box::pin(async move {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(message) = &self.refuse {
                let refused = self
                    .refusals_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if refused {
                    return Err(CapabilityError::Transport(message.clone()));
                }
            }
            let transport: Arc<dyn CapabilityTransport> = self.transport.clone();
            Ok(transport)
        })
    }
}

// ── Fixtures ────────────────────────────────────────────────────

/// AGENT step with dependencies and an authoring position.
pub fn agent_step(key: &str, agent_id: &str, deps: &[&str]) -> WorkflowStep {
    WorkflowStep::agent(key, agent_id).with_depends_on(deps)
}

/// Agent of the given type with empty config.
pub fn agent(id: &str, agent_type: AgentType) -> Agent {
    Agent::new(id, agent_type)
}

/// Active workflow; step positions follow the given order.
pub fn workflow(id: &str, steps: Vec<WorkflowStep>) -> Workflow {
    let steps = steps
        .into_iter()
        .enumerate()
        .map(|(i, s)| s.with_position(i as u32))
        .collect();
    Workflow::new(id, steps)
}

/// Write `contents` to `name` inside a fresh temp dir. Keep the `TempDir`
/// alive for as long as the file is needed.
pub fn temp_file(name: &str, contents: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(name);
    std::fs::write(&path, contents).unwrap();
    (dir, path)
}
