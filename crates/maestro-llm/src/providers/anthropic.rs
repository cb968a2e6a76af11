use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use maestro_core::config::ProviderConfig;
use maestro_core::error::ExecutorError;
use maestro_core::traits::LlmClient;
use maestro_core::types::*;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    http: Client,
    defaults: ProviderConfig,
}

impl AnthropicClient {
    pub fn new() -> Self {
        Self::with_config(ProviderConfig::default())
    }

    pub fn with_config(defaults: ProviderConfig) -> Self {
        Self {
            http: Client::new(),
            defaults,
        }
    }
}

impl Default for AnthropicClient {
    fn default() -> Self {
        Self::new()
    }
}

// Anthropic API request types
#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
}

#[derive(Serialize, Debug, PartialEq)]
pub(crate) struct ApiMessage {
    role: String,
    content: String,
}

// Anthropic API response types
#[derive(Deserialize, Debug)]
struct MessageResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    content: Vec<ContentBlockInfo>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
enum ContentBlockInfo {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug)]
struct UsageInfo {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Anthropic takes the system prompt as a top-level field, not a message.
pub(crate) fn convert_messages(messages: &[ChatMessage]) -> (Option<String>, Vec<ApiMessage>) {
    let mut system: Option<String> = None;
    let mut api_msgs = Vec::new();

    for msg in messages {
        match msg.role {
            Role::System => {
                system = Some(match system {
                    Some(existing) => format!("{}\n\n{}", existing, msg.content),
                    None => msg.content.clone(),
                });
            }
            Role::User => api_msgs.push(ApiMessage {
                role: "user".to_string(),
                content: msg.content.clone(),
            }),
            Role::Assistant => api_msgs.push(ApiMessage {
                role: "assistant".to_string(),
                content: msg.content.clone(),
            }),
        }
    }

    (system, api_msgs)
}

fn into_chat_response(resp: MessageResponse, requested_model: &str) -> ChatResponse {
    let content = resp
        .content
        .iter()
        .filter_map(|b| match b {
            ContentBlockInfo::Text { text } => Some(text.as_str()),
            ContentBlockInfo::Other => None,
        })
        .collect::<Vec<_>>()
        .join("");
    let usage = resp
        .usage
        .map(|u| TokenUsage::new(u.input_tokens, u.output_tokens))
        .unwrap_or_default();

    ChatResponse {
        content,
        model: resp.model.unwrap_or_else(|| requested_model.to_string()),
        usage,
        finish_reason: resp.stop_reason,
    }
}

impl LlmClient for AnthropicClient {
    fn provider(&self) -> &str {
        "anthropic"
    }

    fn chat(&self, request: ChatRequest) -> BoxFuture<'_, Result<ChatResponse, ExecutorError>> {
        Box::pin(async move {
            let url = request
                .base_url
                .as_deref()
                .or(self.defaults.base_url.as_deref())
                .unwrap_or(ANTHROPIC_API_URL)
                .to_string();

            let (system, messages) = convert_messages(&request.messages);
            let body = AnthropicRequest {
                model: request.model.clone(),
                max_tokens: request.max_tokens,
                temperature: request.temperature,
                messages,
                system,
            };

            let mut req = self
                .http
                .post(&url)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("content-type", "application/json")
                .json(&body);

            if let Some(api_key) = request.api_key.as_ref().or(self.defaults.api_key.as_ref()) {
                req = req.header("x-api-key", api_key);
            }
            for (k, v) in &self.defaults.extra_headers {
                req = req.header(k.as_str(), v.as_str());
            }

            debug!(model = %request.model, "Sending Anthropic messages request");

            let response = req
                .send()
                .await
                .map_err(|e| ExecutorError::Network(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown".to_string());
                return Err(ExecutorError::LlmProvider {
                    status: status.as_u16(),
                    body,
                });
            }

            let parsed: MessageResponse =
                response.json().await.map_err(|e| ExecutorError::LlmProvider {
                    status: status.as_u16(),
                    body: format!("unparseable response: {}", e),
                })?;

            Ok(into_chat_response(parsed, &request.model))
        })
    }
}
