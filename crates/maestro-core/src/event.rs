use serde::Serialize;

use crate::types::{ExecutionId, ExecutionStatus, LogLevel, StepStatus};

/// Lifecycle events published while executions run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    ExecutionStarted {
        execution_id: ExecutionId,
        workflow_id: String,
        steps_total: u32,
    },
    StepStarted {
        execution_id: ExecutionId,
        step_key: String,
        attempt: u32,
    },
    StepFinished {
        execution_id: ExecutionId,
        step_key: String,
        status: StepStatus,
        attempts: u32,
    },
    Log {
        execution_id: ExecutionId,
        step_key: Option<String>,
        level: LogLevel,
        message: String,
    },
    ExecutionFinished {
        execution_id: ExecutionId,
        status: ExecutionStatus,
        steps_completed: u32,
        steps_failed: u32,
        error: Option<String>,
    },
}

impl ExecutionEvent {
    pub fn execution_id(&self) -> &ExecutionId {
        match self {
            ExecutionEvent::ExecutionStarted { execution_id, .. }
            | ExecutionEvent::StepStarted { execution_id, .. }
            | ExecutionEvent::StepFinished { execution_id, .. }
            | ExecutionEvent::Log { execution_id, .. }
            | ExecutionEvent::ExecutionFinished { execution_id, .. } => execution_id,
        }
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: ExecutionEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
