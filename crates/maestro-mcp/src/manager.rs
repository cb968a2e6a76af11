use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use maestro_core::config::McpConfig;
use maestro_core::error::CapabilityError;
use maestro_core::traits::CapabilityConnector;
use maestro_core::types::{HealthStatus, InvocationResult};

use crate::connection::{CapabilityConnection, ConnectionState};

/// Owns one shared [`CapabilityConnection`] per configured server.
pub struct ConnectionManager {
    connections: BTreeMap<String, Arc<CapabilityConnection>>,
}

impl ConnectionManager {
    pub fn new(config: &McpConfig, connector: Arc<dyn CapabilityConnector>) -> Self {
        let connections = config
            .servers
            .iter()
            .map(|(name, server_config)| {
                (
                    name.clone(),
                    Arc::new(CapabilityConnection::new(
                        name.clone(),
                        server_config.clone(),
                        connector.clone(),
                    )),
                )
            })
            .collect();
        Self { connections }
    }

    /// Connect every `auto_connect` server. Returns how many came up;
    /// failures are logged and leave that connection in `error`.
    pub async fn init(&self) -> usize {
        let mut connected = 0;
        for (name, conn) in &self.connections {
            if !conn.config().auto_connect {
                continue;
            }
            match conn.connect().await {
                Ok(()) => connected += 1,
                Err(e) => warn!(server = %name, error = %e, "Capability server unavailable"),
            }
        }
        info!(connected, configured = self.connections.len(), "Capability servers initialized");
        connected
    }

    pub fn get(&self, server: &str) -> Option<Arc<CapabilityConnection>> {
        self.connections.get(server).cloned()
    }

    pub fn servers(&self) -> Vec<String> {
        self.connections.keys().cloned().collect()
    }

    pub async fn invoke(
        &self,
        server: &str,
        capability: &str,
        params: serde_json::Value,
    ) -> Result<InvocationResult, CapabilityError> {
        let conn = self
            .get(server)
            .ok_or_else(|| CapabilityError::NotConnected(server.to_string()))?;
        conn.invoke(capability, params).await
    }

    /// Current state and a fresh health probe for every server.
    pub async fn health(&self) -> Vec<(String, ConnectionState, HealthStatus)> {
        let mut out = Vec::with_capacity(self.connections.len());
        for (name, conn) in &self.connections {
            let health = conn.health_check().await;
            out.push((name.clone(), conn.state().await, health));
        }
        out
    }

    /// Close every connection.
    pub async fn shutdown(&self) {
        for conn in self.connections.values() {
            conn.close().await;
        }
    }
}
