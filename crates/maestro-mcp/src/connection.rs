use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use maestro_core::config::CapabilityServerConfig;
use maestro_core::error::CapabilityError;
use maestro_core::traits::{CapabilityConnector, CapabilityTransport};
use maestro_core::types::{HealthStatus, InvocationResult};

use crate::rate_limit::{backoff_delay_ms, FixedWindow};

/// Lifecycle of a [`CapabilityConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    RateLimited,
    Error,
}

impl ConnectionState {
    fn is_live(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::RateLimited)
    }
}

struct Inner {
    state: ConnectionState,
    transport: Option<Arc<dyn CapabilityTransport>>,
    window: FixedWindow,
    failures: u32,
    last_error: Option<String>,
}

/// A stateful, rate-limited link to one capability server.
///
/// Shared by every executor that talks to the server. The state lock is
/// released before the remote call so slow invocations don't serialize
/// unrelated callers.
pub struct CapabilityConnection {
    server: String,
    config: CapabilityServerConfig,
    connector: Arc<dyn CapabilityConnector>,
    inner: Mutex<Inner>,
    connect_lock: Mutex<()>,
}

impl CapabilityConnection {
    pub fn new(
        server: impl Into<String>,
        config: CapabilityServerConfig,
        connector: Arc<dyn CapabilityConnector>,
    ) -> Self {
        let window = FixedWindow::new(&config.rate_limit);
        Self {
            server: server.into(),
            config,
            connector,
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                transport: None,
                window,
                failures: 0,
                last_error: None,
            }),
            connect_lock: Mutex::new(()),
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn config(&self) -> &CapabilityServerConfig {
        &self.config
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    pub async fn last_error(&self) -> Option<String> {
        self.inner.lock().await.last_error.clone()
    }

    /// Open the transport. A no-op when already connected.
    pub async fn connect(&self) -> Result<(), CapabilityError> {
        let _guard = self.connect_lock.lock().await;
        {
            let mut inner = self.inner.lock().await;
            if inner.state.is_live() {
                return Ok(());
            }
            inner.state = ConnectionState::Connecting;
        }

        debug!(server = %self.server, "Connecting to capability server");
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let result = match tokio::time::timeout(
            timeout,
            self.connector.connect(self.server.clone(), self.config.clone()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(CapabilityError::Transport(format!(
                "connect to '{}' timed out after {}s",
                self.server, self.config.timeout_secs
            ))),
        };

        let mut inner = self.inner.lock().await;
        match result {
            Ok(transport) => {
                inner.transport = Some(transport);
                inner.state = ConnectionState::Connected;
                inner.window = FixedWindow::new(&self.config.rate_limit);
                inner.failures = 0;
                inner.last_error = None;
                info!(server = %self.server, "Capability server connected");
                Ok(())
            }
            Err(e) => {
                inner.transport = None;
                inner.state = ConnectionState::Error;
                inner.last_error = Some(e.to_string());
                warn!(server = %self.server, error = %e, "Capability server connect failed");
                Err(e)
            }
        }
    }

    /// Close the transport and return to `disconnected`.
    pub async fn close(&self) {
        let transport = {
            let mut inner = self.inner.lock().await;
            inner.state = ConnectionState::Disconnected;
            inner.failures = 0;
            inner.transport.take()
        };
        if let Some(transport) = transport {
            transport.close().await;
            info!(server = %self.server, "Capability server disconnected");
        }
    }

    /// Invoke a declared capability, subject to the rate-limit window.
    pub async fn invoke(
        &self,
        capability: &str,
        params: serde_json::Value,
    ) -> Result<InvocationResult, CapabilityError> {
        let transport = {
            let mut inner = self.inner.lock().await;
            if !inner.state.is_live() {
                return Err(CapabilityError::NotConnected(self.server.clone()));
            }
            if !self.config.capabilities.iter().any(|c| c == capability) {
                return Err(CapabilityError::UnknownCapability {
                    server: self.server.clone(),
                    capability: capability.to_string(),
                });
            }
            let now = Instant::now();
            match inner.window.try_acquire(now) {
                Ok(()) => inner.state = ConnectionState::Connected,
                Err(retry_after_ms) => {
                    inner.state = ConnectionState::RateLimited;
                    debug!(server = %self.server, retry_after_ms, "Capability rate limited");
                    return Err(CapabilityError::RateLimited {
                        server: self.server.clone(),
                        retry_after_ms,
                    });
                }
            }
            match inner.transport.clone() {
                Some(t) => t,
                None => return Err(CapabilityError::NotConnected(self.server.clone())),
            }
        };

        let start = Instant::now();
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let outcome = match tokio::time::timeout(
            timeout,
            transport.call(capability.to_string(), params),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(format!("timed out after {}s", self.config.timeout_secs)),
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        let mut inner = self.inner.lock().await;
        match outcome {
            Ok(content) => {
                inner.failures = 0;
                debug!(server = %self.server, capability, duration_ms, "Capability invoked");
                Ok(InvocationResult {
                    capability: capability.to_string(),
                    content,
                    duration_ms,
                })
            }
            Err(message) => {
                inner.failures += 1;
                let retry_after_ms = backoff_delay_ms(&self.config.backoff, inner.failures);
                inner.last_error = Some(message.clone());
                if inner.failures >= self.config.backoff.max_retries && inner.state.is_live() {
                    inner.state = ConnectionState::Error;
                    warn!(
                        server = %self.server,
                        failures = inner.failures,
                        "Capability server moved to error state"
                    );
                }
                Err(CapabilityError::InvocationFailed {
                    capability: capability.to_string(),
                    message,
                    retry_after_ms,
                })
            }
        }
    }

    /// Liveness probe. Does not consume a rate-limit slot.
    pub async fn health_check(&self) -> HealthStatus {
        let transport = {
            let inner = self.inner.lock().await;
            if !inner.state.is_live() {
                return HealthStatus {
                    healthy: false,
                    response_time_ms: 0,
                };
            }
            inner.transport.clone()
        };
        let Some(transport) = transport else {
            return HealthStatus {
                healthy: false,
                response_time_ms: 0,
            };
        };

        let start = Instant::now();
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let healthy = matches!(
            tokio::time::timeout(timeout, transport.ping()).await,
            Ok(Ok(()))
        );
        HealthStatus {
            healthy,
            response_time_ms: start.elapsed().as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_core::config::{McpTransport, RateLimitConfig};
    use maestro_test_utils::{MockConnector, MockTransport};

    fn config(caps: &[&str]) -> CapabilityServerConfig {
        CapabilityServerConfig::new(
            McpTransport::Http {
                url: "http://localhost:9".into(),
            },
            caps.iter().map(|c| c.to_string()).collect(),
        )
    }

    fn connection(config: CapabilityServerConfig, transport: Arc<MockTransport>) -> CapabilityConnection {
        CapabilityConnection::new("search", config, Arc::new(MockConnector::new(transport)))
    }

    #[tokio::test]
    async fn test_invoke_before_connect_is_not_connected() {
        let conn = connection(config(&["web_search"]), Arc::new(MockTransport::new()));
        let err = conn
            .invoke("web_search", serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err, CapabilityError::NotConnected("search".into()));
        assert_eq!(conn.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_unknown_capability() {
        let conn = connection(config(&["web_search"]), Arc::new(MockTransport::new()));
        conn.connect().await.unwrap();
        let err = conn.invoke("delete_all", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, CapabilityError::UnknownCapability { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_window() {
        let mut cfg = config(&["web_search"]);
        cfg.rate_limit = RateLimitConfig {
            max_requests: 3,
            window_ms: 1000,
        };
        let transport = Arc::new(MockTransport::new());
        let conn = connection(cfg, transport.clone());
        conn.connect().await.unwrap();

        for _ in 0..3 {
            conn.invoke("web_search", serde_json::json!({"q": "rust"}))
                .await
                .unwrap();
        }
        let err = conn
            .invoke("web_search", serde_json::json!({"q": "rust"}))
            .await
            .unwrap_err();
        assert!(matches!(err, CapabilityError::RateLimited { .. }));
        assert_eq!(conn.state().await, ConnectionState::RateLimited);

        tokio::time::advance(Duration::from_millis(1000)).await;
        conn.invoke("web_search", serde_json::json!({"q": "rust"}))
            .await
            .unwrap();
        assert_eq!(conn.state().await, ConnectionState::Connected);
        assert_eq!(transport.calls(), 4);
    }

    #[tokio::test]
    async fn test_health_check_does_not_use_window() {
        let mut cfg = config(&["web_search"]);
        cfg.rate_limit.max_requests = 1;
        let conn = connection(cfg, Arc::new(MockTransport::new()));
        conn.connect().await.unwrap();

        for _ in 0..3 {
            assert!(conn.health_check().await.healthy);
        }
        conn.invoke("web_search", serde_json::json!({})).await.unwrap();
    }

    #[tokio::test]
    async fn test_failures_back_off_then_error_state() {
        let mut cfg = config(&["web_search"]);
        cfg.backoff.base_delay_ms = 100;
        cfg.backoff.max_delay_ms = 1000;
        cfg.backoff.max_retries = 3;
        let transport = Arc::new(MockTransport::new());
        transport.fail_next(3, "boom");
        let conn = connection(cfg, transport);
        conn.connect().await.unwrap();

        let mut delays = vec![];
        for _ in 0..3 {
            match conn.invoke("web_search", serde_json::json!({})).await {
                Err(CapabilityError::InvocationFailed { retry_after_ms, .. }) => {
                    delays.push(retry_after_ms)
                }
                other => panic!("unexpected: {:?}", other),
            }
        }
        assert_eq!(delays, vec![100, 200, 400]);
        assert_eq!(conn.state().await, ConnectionState::Error);
        assert_eq!(conn.last_error().await.as_deref(), Some("boom"));

        let err = conn.invoke("web_search", serde_json::json!({})).await.unwrap_err();
        assert_eq!(err, CapabilityError::NotConnected("search".into()));
    }

    #[tokio::test]
    async fn test_success_resets_failure_counter() {
        let mut cfg = config(&["web_search"]);
        cfg.backoff.max_retries = 2;
        let transport = Arc::new(MockTransport::new());
        let conn = connection(cfg, transport.clone());
        conn.connect().await.unwrap();

        transport.fail_next(1, "flaky");
        assert!(conn.invoke("web_search", serde_json::json!({})).await.is_err());
        conn.invoke("web_search", serde_json::json!({})).await.unwrap();
        transport.fail_next(1, "flaky");
        assert!(conn.invoke("web_search", serde_json::json!({})).await.is_err());
        assert_eq!(conn.state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_close_returns_to_disconnected() {
        let transport = Arc::new(MockTransport::new());
        let conn = connection(config(&["web_search"]), transport.clone());
        conn.connect().await.unwrap();
        conn.close().await;
        assert_eq!(conn.state().await, ConnectionState::Disconnected);
        assert!(transport.is_closed());
        assert!(!conn.health_check().await.healthy);
    }

    #[tokio::test]
    async fn test_refused_connect_then_reconnect() {
        let transport = Arc::new(MockTransport::new().with_response(serde_json::json!({ "hits": 3 })));
        let connector = Arc::new(MockConnector::refusing_first(1, "connection refused", transport));
        let conn = CapabilityConnection::new("search", config(&["web_search"]), connector.clone());

        let err = conn.connect().await.unwrap_err();
        assert_eq!(err, CapabilityError::Transport("connection refused".into()));
        assert_eq!(conn.state().await, ConnectionState::Error);
        assert_eq!(conn.last_error().await.as_deref(), Some(err.to_string().as_str()));
        assert_eq!(
            conn.invoke("web_search", serde_json::json!({})).await.unwrap_err(),
            CapabilityError::NotConnected("search".into())
        );

        conn.connect().await.unwrap();
        assert_eq!(conn.state().await, ConnectionState::Connected);
        assert_eq!(conn.last_error().await, None);
        assert_eq!(connector.connects(), 2);
        let result = conn.invoke("web_search", serde_json::json!({})).await.unwrap();
        assert_eq!(result.content, serde_json::json!({ "hits": 3 }));
    }

    #[tokio::test]
    async fn test_always_refusing_server_stays_in_error() {
        let connector = Arc::new(MockConnector::refusing("no route to host"));
        let conn = CapabilityConnection::new("search", config(&["web_search"]), connector.clone());
        for _ in 0..2 {
            assert!(conn.connect().await.is_err());
            assert_eq!(conn.state().await, ConnectionState::Error);
        }
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_is_error_state() {
        let mut cfg = config(&["web_search"]);
        cfg.timeout_secs = 1;
        let connector = MockConnector::new(Arc::new(MockTransport::new())).with_delay(Duration::from_secs(5));
        let conn = CapabilityConnection::new("search", cfg, Arc::new(connector));

        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, CapabilityError::Transport(ref m) if m.contains("timed out after 1s")));
        assert_eq!(conn.state().await, ConnectionState::Error);
    }
}
