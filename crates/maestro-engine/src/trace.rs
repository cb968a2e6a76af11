use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use maestro_core::error::Result;
use maestro_core::event::{EventBus, ExecutionEvent};
use maestro_core::traits::ExecutionStore;
use maestro_core::types::*;

struct TraceState {
    execution: Execution,
    /// Final (or aggregate) state per step key.
    step_states: HashMap<String, StepStatus>,
    outputs: Map<String, Value>,
    records: Vec<StepExecutionRecord>,
    logs: Vec<ExecutionLogEntry>,
}

/// Live record of one execution.
///
/// The scheduler is the single writer for counters and step states;
/// [`ExecutionTrace::try_cancel`] is the only other status writer. Every
/// mutation is forwarded to the [`ExecutionStore`] while the write lock is
/// held, so the store always sees updates in order, and then published on
/// the [`EventBus`].
pub struct ExecutionTrace {
    id: ExecutionId,
    state: RwLock<TraceState>,
    store: Arc<dyn ExecutionStore>,
    events: Arc<EventBus>,
}

impl ExecutionTrace {
    /// Persist a fresh PENDING execution and wrap it.
    pub async fn create(
        execution: Execution,
        store: Arc<dyn ExecutionStore>,
        events: Arc<EventBus>,
    ) -> Result<Self> {
        store.persist_execution(&execution).await?;
        Ok(Self {
            id: execution.id.clone(),
            state: RwLock::new(TraceState {
                execution,
                step_states: HashMap::new(),
                outputs: Map::new(),
                records: Vec::new(),
                logs: Vec::new(),
            }),
            store,
            events,
        })
    }

    pub fn id(&self) -> &ExecutionId {
        &self.id
    }

    async fn persist(&self, execution: &Execution) {
        if let Err(e) = self.store.persist_execution(execution).await {
            warn!(execution_id = %self.id, error = %e, "Failed to persist execution");
        }
    }

    async fn persist_record(&self, record: &StepExecutionRecord) {
        if let Err(e) = self.store.persist_step_record(record).await {
            warn!(execution_id = %self.id, step_key = %record.step_key, error = %e, "Failed to persist step record");
        }
    }

    /// PENDING → RUNNING. Returns false if the execution already left
    /// PENDING (for example, it was cancelled before the scheduler started).
    pub async fn start(&self) -> bool {
        let mut state = self.state.write().await;
        if state.execution.status != ExecutionStatus::Pending {
            return false;
        }
        state.execution.status = ExecutionStatus::Running;
        state.execution.started_at = Some(Utc::now());
        self.persist(&state.execution).await;
        let event = ExecutionEvent::ExecutionStarted {
            execution_id: self.id.clone(),
            workflow_id: state.execution.workflow_id.clone(),
            steps_total: state.execution.steps_total,
        };
        drop(state);
        self.events.publish(event);
        true
    }

    /// Record a step's final state and update the counters in the same
    /// critical section. A step key settles once; later calls return false.
    pub async fn finish_step(&self, step_key: &str, status: StepStatus, attempts: u32) -> bool {
        let mut state = self.state.write().await;
        if state.step_states.get(step_key).is_some_and(|s| s.is_terminal()) {
            return false;
        }
        state.step_states.insert(step_key.to_string(), status);
        match status {
            StepStatus::Completed => state.execution.steps_completed += 1,
            StepStatus::Failed => state.execution.steps_failed += 1,
            StepStatus::Skipped => {
                let record = StepExecutionRecord::skipped(&self.id, step_key);
                self.persist_record(&record).await;
                state.records.push(record);
            }
            _ => {}
        }
        self.persist(&state.execution).await;
        drop(state);

        debug!(execution_id = %self.id, step_key, status = %status, "Step settled");
        self.events.publish(ExecutionEvent::StepFinished {
            execution_id: self.id.clone(),
            step_key: step_key.to_string(),
            status,
            attempts,
        });
        true
    }

    /// Settle every listed step that has no final state yet: CANCELLED if it
    /// ever ran, SKIPPED otherwise. Records still RUNNING become CANCELLED.
    pub async fn close_out(&self, keys: &[String]) {
        let dangling: Vec<StepExecutionRecord> = {
            let mut state = self.state.write().await;
            let mut cancelled = Vec::new();
            for record in state.records.iter_mut() {
                if record.status == StepStatus::Running {
                    *record = record.clone().cancel();
                    cancelled.push(record.clone());
                }
            }
            cancelled
        };
        for record in &dangling {
            self.persist_record(record).await;
        }

        for key in keys {
            let ran = {
                let state = self.state.read().await;
                if state.step_states.get(key).is_some_and(|s| s.is_terminal()) {
                    continue;
                }
                state.records.iter().any(|r| &r.step_key == key)
            };
            let status = if ran {
                StepStatus::Cancelled
            } else {
                StepStatus::Skipped
            };
            self.finish_step(key, status, 0).await;
        }
    }

    /// Move to a terminal status unless one was already reached.
    pub async fn finalize(
        &self,
        status: ExecutionStatus,
        output: Option<Value>,
        error: Option<String>,
    ) -> bool {
        let mut state = self.state.write().await;
        if state.execution.status.is_terminal() {
            return false;
        }
        state.execution.status = status;
        state.execution.output_data = output;
        state.execution.error_message = error;
        state.execution.completed_at = Some(Utc::now());
        self.persist(&state.execution).await;
        let event = finished_event(&state.execution);
        drop(state);
        self.events.publish(event);
        true
    }

    /// Compare-and-set to CANCELLED. Returns whether this call made the
    /// transition, and the status afterwards.
    pub async fn try_cancel(&self) -> (bool, ExecutionStatus) {
        let mut state = self.state.write().await;
        if state.execution.status.is_terminal() {
            return (false, state.execution.status);
        }
        state.execution.status = ExecutionStatus::Cancelled;
        state.execution.error_message = Some("Execution cancelled".to_string());
        state.execution.completed_at = Some(Utc::now());
        self.persist(&state.execution).await;
        let event = finished_event(&state.execution);
        drop(state);
        self.events.publish(event);
        (true, ExecutionStatus::Cancelled)
    }

    pub async fn append_log(&self, entry: ExecutionLogEntry) {
        let mut state = self.state.write().await;
        if let Err(e) = self.store.append_execution_log(&entry).await {
            warn!(execution_id = %self.id, error = %e, "Failed to persist execution log");
        }
        let event = ExecutionEvent::Log {
            execution_id: self.id.clone(),
            step_key: entry.step_key.clone(),
            level: entry.level,
            message: entry.message.clone(),
        };
        state.logs.push(entry);
        drop(state);
        self.events.publish(event);
    }

    pub async fn log(
        &self,
        level: LogLevel,
        step_key: Option<&str>,
        attempt: Option<u32>,
        message: impl Into<String>,
    ) {
        let mut entry = ExecutionLogEntry::new(&self.id, level, message);
        if let Some(key) = step_key {
            entry = entry.for_step(key, attempt);
        }
        self.append_log(entry).await;
    }

    /// Insert or update an attempt record, keyed by step, attempt, and
    /// iteration.
    pub async fn record_attempt(&self, record: StepExecutionRecord) {
        let mut state = self.state.write().await;
        self.persist_record(&record).await;
        let started = record.status == StepStatus::Running;
        let (step_key, attempt) = (record.step_key.clone(), record.attempt);
        let slot = state.records.iter_mut().find(|r| {
            r.step_key == record.step_key && r.attempt == record.attempt && r.iteration == record.iteration
        });
        match slot {
            Some(existing) => *existing = record,
            None => state.records.push(record),
        }
        drop(state);
        if started {
            self.events.publish(ExecutionEvent::StepStarted {
                execution_id: self.id.clone(),
                step_key,
                attempt,
            });
        }
    }

    pub async fn set_step_output(&self, step_key: &str, output: Value) {
        self.state
            .write()
            .await
            .outputs
            .insert(step_key.to_string(), output);
    }

    pub async fn status(&self) -> ExecutionStatus {
        self.state.read().await.execution.status
    }

    pub async fn snapshot(&self) -> Execution {
        self.state.read().await.execution.clone()
    }

    pub async fn logs(&self) -> Vec<ExecutionLogEntry> {
        self.state.read().await.logs.clone()
    }

    pub async fn step_records(&self) -> Vec<StepExecutionRecord> {
        self.state.read().await.records.clone()
    }

    pub async fn step_status(&self, step_key: &str) -> Option<StepStatus> {
        self.state.read().await.step_states.get(step_key).copied()
    }

    pub async fn outputs(&self) -> Map<String, Value> {
        self.state.read().await.outputs.clone()
    }
}

fn finished_event(execution: &Execution) -> ExecutionEvent {
    ExecutionEvent::ExecutionFinished {
        execution_id: execution.id.clone(),
        status: execution.status,
        steps_completed: execution.steps_completed,
        steps_failed: execution.steps_failed,
        error: execution.error_message.clone(),
    }
}
