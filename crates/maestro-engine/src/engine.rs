use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use maestro_core::config::{AppConfig, EngineConfig};
use maestro_core::error::{MaestroError, Result};
use maestro_core::event::EventBus;
use maestro_core::traits::{ExecutionStore, WorkflowStore};
use maestro_core::types::*;
use maestro_executors::{ExecutorDeps, ExecutorRegistry};
use maestro_mcp::{ConnectionManager, RmcpConnector};

use crate::graph::StepGraph;
use crate::limits::AgentLimiter;
use crate::runner::StepRunner;
use crate::scheduler::{CancelOutcome, ExecuteOptions, Scheduler};
use crate::trace::ExecutionTrace;

/// Entry point for callers: validation, execution, and execution queries.
///
/// One instance owns its executor registry, agent limiter, and event bus;
/// nothing here is process-global.
pub struct WorkflowEngine {
    scheduler: Arc<Scheduler>,
    workflows: Arc<dyn WorkflowStore>,
    store: Arc<dyn ExecutionStore>,
    events: Arc<EventBus>,
    connections: Option<Arc<ConnectionManager>>,
}

impl WorkflowEngine {
    pub fn new(
        config: EngineConfig,
        workflows: Arc<dyn WorkflowStore>,
        store: Arc<dyn ExecutionStore>,
        registry: ExecutorRegistry,
    ) -> Self {
        let events = Arc::new(EventBus::new(config.event_capacity.max(1)));
        let connections = registry.deps().connections.clone();
        let runner = StepRunner::new(Arc::new(registry), workflows.clone(), Arc::new(AgentLimiter::new()));
        let scheduler = Scheduler::new(config, workflows.clone(), store.clone(), events.clone(), runner);
        Self {
            scheduler,
            workflows,
            store,
            events,
            connections,
        }
    }

    /// Build an engine with the built-in executors, LLM clients from
    /// `[llm]`, and a connected capability manager when `[mcp]` is set.
    pub async fn bootstrap(
        config: &AppConfig,
        workflows: Arc<dyn WorkflowStore>,
        store: Arc<dyn ExecutionStore>,
    ) -> Self {
        let connections = match &config.mcp {
            Some(mcp) => {
                let manager = Arc::new(ConnectionManager::new(mcp, Arc::new(RmcpConnector::new())));
                let connected = manager.init().await;
                info!(servers = mcp.servers.len(), connected, "Capability servers initialized");
                Some(manager)
            }
            None => None,
        };
        let deps = ExecutorDeps {
            llm_clients: maestro_llm::default_clients(&config.llm),
            connections,
            sandbox: config.sandbox.clone(),
            ..ExecutorDeps::default()
        };
        Self::new(
            config.engine.clone(),
            workflows,
            store,
            ExecutorRegistry::with_builtins(deps),
        )
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    /// Build the step graph without running anything.
    pub fn validate_workflow(&self, workflow: &Workflow) -> Result<StepGraph> {
        Ok(StepGraph::build(&workflow.steps)?)
    }

    /// Check a stored workflow before it is switched to ACTIVE: the graph
    /// must build and every referenced agent must exist.
    pub async fn activate_workflow(&self, workflow_id: &str) -> Result<Workflow> {
        let mut workflow = self
            .workflows
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| MaestroError::NotFound(format!("workflow '{}'", workflow_id)))?;
        StepGraph::build(&workflow.steps)?;
        for agent_id in workflow.steps.iter().filter_map(|s| s.agent_id.as_deref()) {
            if self.workflows.get_agent(agent_id).await?.is_none() {
                return Err(MaestroError::NotFound(format!("agent '{}'", agent_id)));
            }
        }
        workflow.status = WorkflowStatus::Active;
        info!(workflow_id, steps = workflow.steps.len(), "Workflow activated");
        Ok(workflow)
    }

    /// Run a workflow and wait for its terminal state.
    pub async fn execute_workflow(&self, workflow_id: &str, trigger: TriggerType, input: Value) -> Result<Execution> {
        self.execute_with(workflow_id, input, ExecuteOptions::trigger(trigger))
            .await
    }

    pub async fn execute_with(&self, workflow_id: &str, input: Value, options: ExecuteOptions) -> Result<Execution> {
        self.scheduler.execute(workflow_id, input, options).await
    }

    /// Start a workflow and return once it is RUNNING.
    pub async fn submit_workflow(&self, workflow_id: &str, trigger: TriggerType, input: Value) -> Result<Execution> {
        self.scheduler
            .submit(workflow_id, input, ExecuteOptions::trigger(trigger))
            .await
    }

    pub async fn get_execution(&self, id: &ExecutionId) -> Result<Execution> {
        self.scheduler.get(id).await
    }

    pub async fn list_executions(&self, workflow_id: &str) -> Result<Vec<Execution>> {
        self.store.list_executions(workflow_id).await
    }

    pub async fn list_execution_logs(&self, id: &ExecutionId) -> Result<Vec<ExecutionLogEntry>> {
        self.store.list_execution_logs(id).await
    }

    pub async fn list_step_records(&self, id: &ExecutionId) -> Result<Vec<StepExecutionRecord>> {
        self.store.list_step_records(id).await
    }

    /// Live trace of an execution this engine is running.
    pub fn trace(&self, id: &ExecutionId) -> Option<Arc<ExecutionTrace>> {
        self.scheduler.trace(id)
    }

    pub async fn cancel_execution(&self, id: &ExecutionId) -> Result<CancelOutcome> {
        self.scheduler.cancel(id).await
    }

    /// Cancel running executions and close capability connections.
    pub async fn shutdown(&self) {
        let running = self.scheduler.active_count();
        if running > 0 {
            warn!(running, "Cancelling running executions on shutdown");
        }
        self.scheduler.cancel_all().await;
        if let Some(connections) = &self.connections {
            connections.shutdown().await;
        }
    }
}
