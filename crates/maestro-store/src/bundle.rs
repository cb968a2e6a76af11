use std::path::Path;

use serde::{Deserialize, Serialize};

use maestro_core::error::{MaestroError, Result};
use maestro_core::types::{Agent, Workflow};

/// A workflow together with the agents its steps are bound to.
///
/// This is the file format the CLI loads: JSON, or TOML when the file ends
/// in `.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowBundle {
    pub workflow: Workflow,
    #[serde(default)]
    pub agents: Vec<Agent>,
}

impl WorkflowBundle {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| MaestroError::NotFound(format!("workflow file {}", path.display())))?;
        let is_toml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("toml"));
        if is_toml {
            toml::from_str(&content).map_err(|e| MaestroError::Config(e.to_string()))
        } else {
            Ok(serde_json::from_str(&content)?)
        }
    }

    /// Agent ids referenced by steps but missing from the bundle.
    pub fn missing_agents(&self) -> Vec<String> {
        let mut missing: Vec<String> = self
            .workflow
            .steps
            .iter()
            .filter_map(|s| s.agent_id.clone())
            .filter(|id| !self.agents.iter().any(|a| &a.id == id))
            .collect();
        missing.sort();
        missing.dedup();
        missing
    }
}
