pub mod api;
pub mod code;
pub mod data;
pub mod llm;
pub mod registry;
pub mod workflow;

pub use api::ApiExecutor;
pub use code::CodeExecutor;
pub use data::DataExecutor;
pub use llm::LlmExecutor;
pub use registry::{ExecutorDeps, ExecutorFactory, ExecutorRegistry};
pub use workflow::WorkflowExecutor;

/// Parse an agent's config map into a typed config struct.
pub(crate) fn parse_config<T: serde::de::DeserializeOwned>(
    agent: &maestro_core::types::Agent,
) -> Result<T, maestro_core::error::ExecutorError> {
    serde_json::from_value(serde_json::Value::Object(agent.config.clone()))
        .map_err(|e| maestro_core::error::ExecutorError::InvalidConfig(e.to_string()))
}
