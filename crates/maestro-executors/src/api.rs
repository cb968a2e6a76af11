use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use maestro_core::error::ExecutorError;
use maestro_core::template::{resolve_value, substitute};
use maestro_core::traits::{check_agent_type, AgentExecutor, ExecutorInput};
use maestro_core::types::*;
use maestro_mcp::ConnectionManager;

use crate::parse_config;

/// Calls a REST endpoint, or a capability on an MCP server.
pub struct ApiExecutor {
    http: reqwest::Client,
    connections: Option<Arc<ConnectionManager>>,
    metrics: Option<ExecutionMetrics>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiConfig {
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    query: HashMap<String, String>,
    #[serde(default)]
    auth: Option<AuthConfig>,
    #[serde(default)]
    body: Option<Value>,
    #[serde(default)]
    capability: Option<CapabilityCall>,
}

fn default_method() -> String {
    "GET".into()
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum AuthConfig {
    Bearer {
        token: String,
    },
    Basic {
        username: String,
        #[serde(default)]
        password: Option<String>,
    },
    ApiKey {
        #[serde(default = "default_api_key_header")]
        header: String,
        key: String,
    },
}

fn default_api_key_header() -> String {
    "X-API-Key".into()
}

#[derive(Deserialize)]
struct CapabilityCall {
    server: String,
    name: String,
    #[serde(default)]
    params: Value,
}

impl ApiExecutor {
    pub fn new(http: reqwest::Client, connections: Option<Arc<ConnectionManager>>) -> Self {
        Self {
            http,
            connections,
            metrics: None,
        }
    }

    async fn invoke_capability(
        &self,
        call: CapabilityCall,
        vars: &Value,
    ) -> Result<ExecutionResult, ExecutorError> {
        let manager = self.connections.as_ref().ok_or_else(|| {
            ExecutorError::InvalidConfig("capability calls need configured MCP servers".into())
        })?;
        let params = resolve_value(&call.params, vars);
        debug!(server = %call.server, capability = %call.name, "Invoking capability");

        let result = manager.invoke(&call.server, &call.name, params).await?;
        Ok(ExecutionResult::new(json!({
            "server": call.server,
            "capability": result.capability,
            "content": result.content,
            "durationMs": result.duration_ms,
        })))
    }

    async fn send_request(
        &self,
        config: ApiConfig,
        vars: &Value,
        timeout_ms: u64,
    ) -> Result<ExecutionResult, ExecutorError> {
        let url = config
            .url
            .as_deref()
            .map(|u| substitute(u, vars))
            .ok_or_else(|| ExecutorError::MissingConfig("url".into()))?;
        let method = config
            .method
            .to_uppercase()
            .parse::<reqwest::Method>()
            .map_err(|e| ExecutorError::InvalidConfig(format!("Invalid method: {}", e)))?;

        let mut req = self
            .http
            .request(method.clone(), &url)
            .timeout(Duration::from_millis(timeout_ms));
        for (k, v) in &config.headers {
            req = req.header(k.as_str(), substitute(v, vars));
        }
        if !config.query.is_empty() {
            let query: Vec<(String, String)> = config
                .query
                .iter()
                .map(|(k, v)| (k.clone(), substitute(v, vars)))
                .collect();
            req = req.query(&query);
        }
        req = match &config.auth {
            Some(AuthConfig::Bearer { token }) => req.bearer_auth(substitute(token, vars)),
            Some(AuthConfig::Basic { username, password }) => req.basic_auth(
                substitute(username, vars),
                password.as_deref().map(|p| substitute(p, vars)),
            ),
            Some(AuthConfig::ApiKey { header, key }) => {
                req.header(header.as_str(), substitute(key, vars))
            }
            None => req,
        };
        if let Some(body) = &config.body {
            req = match resolve_value(body, vars) {
                Value::String(text) => req.body(text),
                other => req.json(&other),
            };
        }

        debug!(method = %method, url = %url, "Sending API request");

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                ExecutorError::Timeout(timeout_ms)
            } else {
                ExecutorError::Network(e.to_string())
            }
        })?;

        let status = resp.status();
        let headers: serde_json::Map<String, Value> = resp
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v.to_str().unwrap_or("?"))))
            .collect();
        let text = resp.text().await.map_err(|e| {
            if e.is_timeout() {
                ExecutorError::Timeout(timeout_ms)
            } else {
                ExecutorError::Network(e.to_string())
            }
        })?;

        if !status.is_success() {
            return Err(ExecutorError::ApiHttp {
                status: status.as_u16(),
                body: text,
            });
        }

        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
        Ok(ExecutionResult::new(json!({
            "status": status.as_u16(),
            "headers": headers,
            "body": body,
        })))
    }
}

impl AgentExecutor for ApiExecutor {
    fn agent_type(&self) -> AgentType {
        AgentType::Api
    }

    fn validate_input(&self, input: &ExecutorInput) -> Result<(), ExecutorError> {
        check_agent_type(AgentType::Api, &input.agent)?;
        let config: ApiConfig = parse_config(&input.agent)?;
        if config.url.is_none() && config.capability.is_none() {
            return Err(ExecutorError::MissingConfig("url".into()));
        }
        Ok(())
    }

    fn execute(
        &mut self,
        input: ExecutorInput,
    ) -> BoxFuture<'_, Result<ExecutionResult, ExecutorError>> {
        Box::pin(async move {
            let mut config: ApiConfig = parse_config(&input.agent)?;
            let vars = Value::Object(input.inputs.clone());
            let timeout_ms = input
                .agent
                .max_execution_time_ms
                .min(input.context.timeout_ms);

            let started = Instant::now();
            let result = match config.capability.take() {
                Some(call) => self.invoke_capability(call, &vars).await,
                None => self.send_request(config, &vars, timeout_ms).await,
            };
            self.metrics = Some(ExecutionMetrics {
                duration_ms: started.elapsed().as_millis() as u64,
                api_calls: 1,
                ..Default::default()
            });
            result
        })
    }

    fn collect_metrics(&self) -> Option<ExecutionMetrics> {
        self.metrics.clone()
    }
}
