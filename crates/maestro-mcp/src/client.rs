use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::{debug, info};

use rmcp::model::{CallToolRequestParams, RawContent};
use rmcp::service::{Peer, RunningService};
use rmcp::transport::streamable_http_client::StreamableHttpClientTransport;
use rmcp::{RoleClient, ServiceExt};

use maestro_core::config::{CapabilityServerConfig, McpTransport};
use maestro_core::error::CapabilityError;
use maestro_core::traits::{CapabilityConnector, CapabilityTransport};

use crate::handler::MaestroClientHandler;

type McpConnection = RunningService<RoleClient, MaestroClientHandler>;

/// Opens MCP sessions over stdio child processes or streamable HTTP.
#[derive(Default)]
pub struct RmcpConnector;

impl RmcpConnector {
    pub fn new() -> Self {
        Self
    }
}

impl CapabilityConnector for RmcpConnector {
    fn connect(
        &self,
        server: String,
        config: CapabilityServerConfig,
    ) -> BoxFuture<'_, Result<Arc<dyn CapabilityTransport>, CapabilityError>> {
        Box::pin(async move {
            let handler = MaestroClientHandler::new(&server);

            let service: McpConnection = match &config.transport {
                McpTransport::Stdio { command, args, env } => {
                    let mut cmd = tokio::process::Command::new(command);
                    cmd.args(args);
                    for (k, v) in env {
                        cmd.env(k, v);
                    }

                    let transport = rmcp::transport::TokioChildProcess::new(cmd).map_err(|e| {
                        CapabilityError::Transport(format!("Failed to spawn {}: {}", command, e))
                    })?;

                    handler.serve(transport).await.map_err(|e| {
                        CapabilityError::Transport(format!(
                            "MCP init for '{}' failed: {}",
                            server, e
                        ))
                    })?
                }
                McpTransport::Http { url } => {
                    let transport = StreamableHttpClientTransport::from_uri(url.as_str());

                    <MaestroClientHandler as ServiceExt<RoleClient>>::serve(handler, transport)
                        .await
                        .map_err(|e| {
                            CapabilityError::Transport(format!(
                                "MCP init for '{}' failed: {}",
                                server, e
                            ))
                        })?
                }
            };

            info!(server = %server, "MCP session established");
            let peer = service.peer().clone();
            let transport: Arc<dyn CapabilityTransport> = Arc::new(RmcpTransport {
                server,
                peer,
                service: Mutex::new(Some(service)),
            });
            Ok(transport)
        })
    }
}

/// One live MCP session. Capabilities map onto MCP tools.
pub struct RmcpTransport {
    server: String,
    peer: Peer<RoleClient>,
    service: Mutex<Option<McpConnection>>,
}

/// Tool output as JSON: a single text block that parses as JSON is returned
/// as that value, anything else as the joined text.
fn content_to_value(blocks: &[String]) -> serde_json::Value {
    if let [only] = blocks {
        if let Ok(value) = serde_json::from_str(only) {
            return value;
        }
    }
    serde_json::Value::String(blocks.join("\n"))
}

impl CapabilityTransport for RmcpTransport {
    fn call(
        &self,
        capability: String,
        params: serde_json::Value,
    ) -> BoxFuture<'_, Result<serde_json::Value, String>> {
        Box::pin(async move {
            debug!(server = %self.server, capability = %capability, "Calling MCP tool");

            let request = CallToolRequestParams {
                name: capability.clone().into(),
                arguments: params.as_object().cloned(),
                meta: None,
                task: None,
            };

            let result = self
                .peer
                .call_tool(request)
                .await
                .map_err(|e| format!("Tool call '{}.{}' failed: {}", self.server, capability, e))?;

            let blocks: Vec<String> = result
                .content
                .iter()
                .map(|c| match c.raw {
                    RawContent::Text(ref t) => t.text.to_string(),
                    _ => format!("{:?}", c.raw),
                })
                .collect();

            if result.is_error.unwrap_or(false) {
                return Err(blocks.join("\n"));
            }
            Ok(content_to_value(&blocks))
        })
    }

    fn ping(&self) -> BoxFuture<'_, Result<(), String>> {
        Box::pin(async move {
            let closed = self
                .service
                .lock()
                .await
                .as_ref()
                .map(|s| s.is_closed())
                .unwrap_or(true);
            if closed {
                return Err(format!("session for '{}' is closed", self.server));
            }
            self.peer
                .list_all_tools()
                .await
                .map(|_| ())
                .map_err(|e| e.to_string())
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Some(mut service) = self.service.lock().await.take() {
                let _ = service.close().await;
            }
        })
    }
}
