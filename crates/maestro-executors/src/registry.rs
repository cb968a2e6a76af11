use std::collections::HashMap;
use std::sync::Arc;

use maestro_core::config::SandboxConfig;
use maestro_core::error::ExecutorError;
use maestro_core::traits::{AgentExecutor, LlmClient};
use maestro_core::types::AgentType;
use maestro_mcp::ConnectionManager;

use crate::{ApiExecutor, CodeExecutor, DataExecutor, LlmExecutor, WorkflowExecutor};

/// Shared collaborators handed to every executor factory.
#[derive(Clone, Default)]
pub struct ExecutorDeps {
    /// LLM clients keyed by provider name.
    pub llm_clients: HashMap<String, Arc<dyn LlmClient>>,
    pub connections: Option<Arc<ConnectionManager>>,
    pub sandbox: SandboxConfig,
    pub http: reqwest::Client,
}

/// Builds a fresh executor per call.
pub type ExecutorFactory = Arc<dyn Fn(&ExecutorDeps) -> Box<dyn AgentExecutor> + Send + Sync>;

/// Maps each agent type to the factory that serves it.
pub struct ExecutorRegistry {
    factories: HashMap<AgentType, ExecutorFactory>,
    deps: ExecutorDeps,
}

impl ExecutorRegistry {
    pub fn new(deps: ExecutorDeps) -> Self {
        Self {
            factories: HashMap::new(),
            deps,
        }
    }

    /// Register (or replace) the factory for an agent type.
    pub fn register(&mut self, agent_type: AgentType, factory: ExecutorFactory) {
        self.factories.insert(agent_type, factory);
    }

    pub fn contains(&self, agent_type: AgentType) -> bool {
        self.factories.contains_key(&agent_type)
    }

    pub fn deps(&self) -> &ExecutorDeps {
        &self.deps
    }

    /// Instantiate an executor for one call.
    pub fn create(&self, agent_type: AgentType) -> Result<Box<dyn AgentExecutor>, ExecutorError> {
        let factory = self.factories.get(&agent_type).ok_or_else(|| {
            ExecutorError::InvalidConfig(format!("no executor registered for {}", agent_type))
        })?;
        Ok(factory(&self.deps))
    }

    /// Create a registry with every built-in executor registered.
    pub fn with_builtins(deps: ExecutorDeps) -> Self {
        let mut registry = Self::new(deps);
        for agent_type in AgentType::ALL {
            registry.register(agent_type, builtin_factory(agent_type));
        }
        registry
    }
}

fn builtin_factory(agent_type: AgentType) -> ExecutorFactory {
    match agent_type {
        AgentType::Code => Arc::new(|deps: &ExecutorDeps| -> Box<dyn AgentExecutor> {
            Box::new(CodeExecutor::new(deps.sandbox.clone()))
        }),
        AgentType::Api => Arc::new(|deps: &ExecutorDeps| -> Box<dyn AgentExecutor> {
            Box::new(ApiExecutor::new(deps.http.clone(), deps.connections.clone()))
        }),
        AgentType::Llm => Arc::new(|deps: &ExecutorDeps| -> Box<dyn AgentExecutor> {
            Box::new(LlmExecutor::new(deps.llm_clients.clone()))
        }),
        AgentType::Data => {
            Arc::new(|_: &ExecutorDeps| -> Box<dyn AgentExecutor> { Box::new(DataExecutor::new()) })
        }
        AgentType::Workflow => Arc::new(|_: &ExecutorDeps| -> Box<dyn AgentExecutor> {
            Box::new(WorkflowExecutor::new())
        }),
    }
}
