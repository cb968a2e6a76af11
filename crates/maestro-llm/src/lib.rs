pub mod providers;

use std::collections::HashMap;
use std::sync::Arc;

use maestro_core::config::LlmConfig;
use maestro_core::error::ExecutorError;
use maestro_core::traits::LlmClient;

pub use providers::anthropic::AnthropicClient;
pub use providers::openai::OpenAiClient;

/// Provider names accepted in an LLM agent's `provider` config field.
pub const SUPPORTED_PROVIDERS: &[&str] = &["openai", "anthropic"];

/// Create an LLM client based on the provider name.
pub fn create_client(
    provider: &str,
    config: &LlmConfig,
) -> Result<Arc<dyn LlmClient>, ExecutorError> {
    let defaults = config.provider(provider).cloned().unwrap_or_default();
    match provider {
        "anthropic" => Ok(Arc::new(AnthropicClient::with_config(defaults))),
        "openai" => Ok(Arc::new(OpenAiClient::with_config(defaults))),
        other => Err(ExecutorError::UnsupportedProvider(other.to_string())),
    }
}

/// One client per supported provider, keyed by provider name.
pub fn default_clients(config: &LlmConfig) -> HashMap<String, Arc<dyn LlmClient>> {
    SUPPORTED_PROVIDERS
        .iter()
        .filter_map(|name| {
            create_client(name, config)
                .ok()
                .map(|client| (name.to_string(), client))
        })
        .collect()
}
