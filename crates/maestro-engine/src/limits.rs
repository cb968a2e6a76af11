use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use maestro_core::types::Agent;

/// Global per-agent concurrency bound, shared by every execution of one
/// engine instance.
///
/// A semaphore is created the first time an agent is seen, sized from its
/// `max_concurrent_executions` (at least one permit).
#[derive(Default)]
pub struct AgentLimiter {
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl AgentLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn semaphore(&self, agent: &Agent) -> Arc<Semaphore> {
        let mut map = self.semaphores.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(agent.id.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(agent.max_concurrent_executions.max(1) as usize)))
            .clone()
    }

    /// Wait for a slot. Returns `None` only if the semaphore was closed.
    pub async fn acquire(&self, agent: &Agent) -> Option<OwnedSemaphorePermit> {
        self.semaphore(agent).acquire_owned().await.ok()
    }

    /// Free slots for an agent that has been seen before.
    pub fn available(&self, agent_id: &str) -> Option<usize> {
        let map = self.semaphores.lock().unwrap_or_else(|e| e.into_inner());
        map.get(agent_id).map(|s| s.available_permits())
    }
}
