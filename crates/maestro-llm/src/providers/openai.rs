use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use maestro_core::config::ProviderConfig;
use maestro_core::error::ExecutorError;
use maestro_core::traits::LlmClient;
use maestro_core::types::*;

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI chat-completions client. Also works with compatible endpoints via `base_url`.
pub struct OpenAiClient {
    http: Client,
    defaults: ProviderConfig,
}

impl OpenAiClient {
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

impl Default for OpenAiClient {
    fn default() -> Self {
        Self::new()
    }
}

// Request types
#[derive(Serialize)]
struct CompletionRequest {
    model: String,
    messages: Vec<OaiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize, Debug, PartialEq)]
pub(crate) struct OaiMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    r#type: String,
}

// Response types
#[derive(Deserialize, Debug)]
struct CompletionResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<OaiUsage>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct OaiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// OpenAI keeps the system prompt as a regular message.
pub(crate) fn convert_messages(messages: &[ChatMessage]) -> Vec<OaiMessage> {
    messages
        .iter()
        .map(|m| OaiMessage {
            role: match m.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            }
            .to_string(),
            content: m.content.clone(),
        })
        .collect()
}

fn into_chat_response(resp: CompletionResponse, requested_model: &str) -> ChatResponse {
    let (content, finish_reason) = resp
        .choices
        .into_iter()
        .next()
        .map(|c| (c.message.content.unwrap_or_default(), c.finish_reason))
        .unwrap_or_default();
    let usage = resp
        .usage
        .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
        .unwrap_or_default();

    ChatResponse {
        content,
        model: resp.model.unwrap_or_else(|| requested_model.to_string()),
        usage,
        finish_reason,
    }
}

impl LlmClient for OpenAiClient {
    fn provider(&self) -> &str {
        "openai"
    }

    fn chat(&self, request: ChatRequest) -> BoxFuture<'_, Result<ChatResponse, ExecutorError>> {
        Box::pin(async move {
            let base_url = request
                .base_url
                .as_deref()
                .or(self.defaults.base_url.as_deref())
                .unwrap_or(OPENAI_API_URL)
                .to_string();

            let body = CompletionRequest {
                model: request.model.clone(),
                messages: convert_messages(&request.messages),
                max_tokens: request.max_tokens,
                temperature: request.temperature,
                response_format: request.json_mode.then(|| ResponseFormat {
                    r#type: "json_object".to_string(),
                }),
            };

            let mut req = self.http.post(&base_url).json(&body);

            if let Some(api_key) = request.api_key.as_ref().or(self.defaults.api_key.as_ref()) {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }
            for (k, v) in &self.defaults.extra_headers {
                req = req.header(k.as_str(), v.as_str());
            }

            debug!(model = %request.model, url = %base_url, "Sending OpenAI chat completion");

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

            let parsed: CompletionResponse =
                response.json().await.map_err(|e| ExecutorError::LlmProvider {
                    status: status.as_u16(),
                    body: format!("unparseable response: {}", e),
                })?;

            Ok(into_chat_response(parsed, &request.model))
        })
    }
}
