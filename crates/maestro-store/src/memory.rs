use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::BoxFuture;

use maestro_core::error::{MaestroError, Result};
use maestro_core::traits::{ExecutionStore, WorkflowStore};
use maestro_core::types::*;

#[derive(Default)]
struct Inner {
    workflows: HashMap<String, Workflow>,
    agents: HashMap<String, Agent>,
    /// Executions in first-insert order.
    executions: Vec<Execution>,
    records: Vec<StepExecutionRecord>,
    logs: Vec<ExecutionLogEntry>,
}

/// Process-local store, used by tests and one-shot CLI runs.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|e| MaestroError::Database(e.to_string()))
    }

    pub fn save_workflow(&self, workflow: &Workflow) -> Result<()> {
        self.lock()?
            .workflows
            .insert(workflow.id.clone(), workflow.clone());
        Ok(())
    }

    pub fn save_agent(&self, agent: &Agent) -> Result<()> {
        self.lock()?.agents.insert(agent.id.clone(), agent.clone());
        Ok(())
    }
}

impl WorkflowStore for MemoryStore {
    fn get_workflow(&self, id: &str) -> BoxFuture<'_, Result<Option<Workflow>>> {
        let id = id.to_string();
        Box::pin(async move { Ok(self.lock()?.workflows.get(&id).cloned()) })
    }

    fn get_agent(&self, id: &str) -> BoxFuture<'_, Result<Option<Agent>>> {
        let id = id.to_string();
        Box::pin(async move { Ok(self.lock()?.agents.get(&id).cloned()) })
    }
}

impl ExecutionStore for MemoryStore {
    fn persist_execution(&self, execution: &Execution) -> BoxFuture<'_, Result<()>> {
        let execution = execution.clone();
        Box::pin(async move {
            let mut inner = self.lock()?;
            match inner.executions.iter_mut().find(|e| e.id == execution.id) {
                Some(existing) => *existing = execution,
                None => inner.executions.push(execution),
            }
            Ok(())
        })
    }

    fn persist_step_record(&self, record: &StepExecutionRecord) -> BoxFuture<'_, Result<()>> {
        let record = record.clone();
        Box::pin(async move {
            let mut inner = self.lock()?;
            let existing = inner.records.iter_mut().find(|r| {
                r.execution_id == record.execution_id
                    && r.step_key == record.step_key
                    && r.attempt == record.attempt
                    && r.iteration == record.iteration
            });
            match existing {
                Some(slot) => *slot = record,
                None => inner.records.push(record),
            }
            Ok(())
        })
    }

    fn append_execution_log(&self, entry: &ExecutionLogEntry) -> BoxFuture<'_, Result<()>> {
        let entry = entry.clone();
        Box::pin(async move {
            self.lock()?.logs.push(entry);
            Ok(())
        })
    }

    fn get_execution(&self, id: &ExecutionId) -> BoxFuture<'_, Result<Option<Execution>>> {
        let id = id.clone();
        Box::pin(async move {
            Ok(self.lock()?.executions.iter().find(|e| e.id == id).cloned())
        })
    }

    fn list_executions(&self, workflow_id: &str) -> BoxFuture<'_, Result<Vec<Execution>>> {
        let workflow_id = workflow_id.to_string();
        Box::pin(async move {
            let inner = self.lock()?;
            let mut list: Vec<(usize, Execution)> = inner
                .executions
                .iter()
                .enumerate()
                .filter(|(_, e)| e.workflow_id == workflow_id)
                .map(|(i, e)| (i, e.clone()))
                .collect();
            list.sort_by(|(ia, a), (ib, b)| b.created_at.cmp(&a.created_at).then(ib.cmp(ia)));
            Ok(list.into_iter().map(|(_, e)| e).collect())
        })
    }

    fn list_execution_logs(&self, id: &ExecutionId) -> BoxFuture<'_, Result<Vec<ExecutionLogEntry>>> {
        let id = id.clone();
        Box::pin(async move {
            Ok(self
                .lock()?
                .logs
                .iter()
                .filter(|l| l.execution_id == id)
                .cloned()
                .collect())
        })
    }

    fn list_step_records(&self, id: &ExecutionId) -> BoxFuture<'_, Result<Vec<StepExecutionRecord>>> {
        let id = id.clone();
        Box::pin(async move {
            Ok(self
                .lock()?
                .records
                .iter()
                .filter(|r| r.execution_id == id)
                .cloned()
                .collect())
        })
    }
}
