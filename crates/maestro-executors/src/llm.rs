use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use maestro_core::error::ExecutorError;
use maestro_core::template::substitute;
use maestro_core::traits::{check_agent_type, require_config, AgentExecutor, ExecutorInput, LlmClient};
use maestro_core::types::*;

use crate::parse_config;

/// Sends one chat completion to the agent's configured provider.
pub struct LlmExecutor {
    clients: HashMap<String, Arc<dyn LlmClient>>,
    metrics: Option<ExecutionMetrics>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LlmAgentConfig {
    provider: String,
    model: String,
    #[serde(default)]
    system_prompt: Option<String>,
    #[serde(default)]
    prompt_template: Option<String>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default = "default_max_tokens")]
    max_tokens: u32,
    /// `"json_object"` or `{ "type": "json_object" }`.
    #[serde(default)]
    response_format: Option<Value>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    base_url: Option<String>,
}

fn default_max_tokens() -> u32 {
    1024
}

impl LlmAgentConfig {
    fn json_mode(&self) -> bool {
        match &self.response_format {
            Some(Value::String(s)) => s == "json_object",
            Some(Value::Object(map)) => map.get("type").and_then(|t| t.as_str()) == Some("json_object"),
            _ => false,
        }
    }
}

/// Parse model output as JSON, tolerating a surrounding markdown fence.
fn parse_json_reply(content: &str) -> Option<Value> {
    let trimmed = content.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    let inner = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))?
        .strip_suffix("```")?;
    serde_json::from_str(inner.trim()).ok()
}

fn build_prompt(config: &LlmAgentConfig, inputs: &JsonMap) -> String {
    let vars = Value::Object(inputs.clone());
    match &config.prompt_template {
        Some(template) => substitute(template, &vars),
        None => match inputs.get("prompt") {
            Some(Value::String(prompt)) => prompt.clone(),
            _ => vars.to_string(),
        },
    }
}

impl LlmExecutor {
    pub fn new(clients: HashMap<String, Arc<dyn LlmClient>>) -> Self {
        Self {
            clients,
            metrics: None,
        }
    }

    fn client(&self, provider: &str) -> Result<Arc<dyn LlmClient>, ExecutorError> {
        self.clients
            .get(provider)
            .cloned()
            .ok_or_else(|| ExecutorError::UnsupportedProvider(provider.to_string()))
    }
}

impl AgentExecutor for LlmExecutor {
    fn agent_type(&self) -> AgentType {
        AgentType::Llm
    }

    fn validate_input(&self, input: &ExecutorInput) -> Result<(), ExecutorError> {
        check_agent_type(AgentType::Llm, &input.agent)?;
        require_config(&input.agent, &["provider", "model"])?;
        let config: LlmAgentConfig = parse_config(&input.agent)?;
        self.client(&config.provider)?;
        Ok(())
    }

    fn execute(
        &mut self,
        input: ExecutorInput,
    ) -> BoxFuture<'_, Result<ExecutionResult, ExecutorError>> {
        Box::pin(async move {
            let config: LlmAgentConfig = parse_config(&input.agent)?;
            let client = self.client(&config.provider)?;
            let vars = Value::Object(input.inputs.clone());

            let mut messages = Vec::new();
            if let Some(system) = &config.system_prompt {
                messages.push(ChatMessage::system(substitute(system, &vars)));
            }
            messages.push(ChatMessage::user(build_prompt(&config, &input.inputs)));

            let json_mode = config.json_mode();
            let request = ChatRequest {
                model: config.model.clone(),
                messages,
                temperature: config.temperature,
                max_tokens: config.max_tokens,
                json_mode,
                api_key: config.api_key.clone(),
                base_url: config.base_url.clone(),
            };

            debug!(
                agent_id = %input.agent.id,
                provider = %config.provider,
                model = %config.model,
                "Calling LLM provider"
            );

            let started = Instant::now();
            let response = tokio::select! {
                r = client.chat(request) => r?,
                _ = input.context.cancel.cancelled() => return Err(ExecutorError::Cancelled),
            };

            self.metrics = Some(ExecutionMetrics {
                duration_ms: started.elapsed().as_millis() as u64,
                prompt_tokens: response.usage.prompt_tokens,
                completion_tokens: response.usage.completion_tokens,
                total_tokens: response.usage.total_tokens,
                api_calls: 1,
            });

            let mut output = json!({
                "content": response.content,
                "model": response.model,
                "usage": response.usage,
                "finishReason": response.finish_reason,
            });
            let mut logs = vec![];
            if json_mode {
                match parse_json_reply(&response.content) {
                    Some(parsed) => output["parsedJson"] = parsed,
                    None => {
                        warn!(agent_id = %input.agent.id, "LLM reply is not valid JSON");
                        logs.push(
                            ExecutorLog::warn("Response requested as json_object is not valid JSON")
                                .with_data(json!({ "content": response.content })),
                        );
                    }
                }
            }

            Ok(ExecutionResult { output, logs })
        })
    }

    fn collect_metrics(&self) -> Option<ExecutionMetrics> {
        self.metrics.clone()
    }
}
