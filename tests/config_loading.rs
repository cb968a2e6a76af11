use std::io::Write;

use maestro_core::config::{AppConfig, McpTransport};
use maestro_core::error::MaestroError;

fn load(toml_content: &str) -> AppConfig {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");
    AppConfig::load(tmp.path()).expect("load config")
}

#[test]
fn test_load_full_config_from_file() {
    let config = load(
        r#"
[engine]
max_in_flight = 4
execution_timeout_ms = 60000
max_nesting_depth = 2

[store]
path = "/tmp/maestro-test.db"

[log]
log_dir = "/tmp/maestro-logs"
level = 3

[llm.openai]
api_key = "sk-test-key"
base_url = "http://localhost:8080/v1"

[sandbox]
mode = "docker"
image = "node:20-slim"

[mcp.servers.search]
auto_connect = true
capabilities = ["web_search"]

[mcp.servers.search.transport]
type = "stdio"
command = "npx"
args = ["-y", "search-mcp"]

[mcp.servers.search.rate_limit]
max_requests = 10
window_ms = 1000

[[cron.jobs]]
name = "nightly"
schedule = "0 0 2 * * *"
workflow_id = "report"
input = { region = "eu" }
"#,
    );

    assert_eq!(config.engine.max_in_flight, 4);
    assert_eq!(config.engine.execution_timeout_ms, 60_000);
    assert_eq!(config.engine.max_nesting_depth, 2);
    assert_eq!(config.store.resolved_path().to_str(), Some("/tmp/maestro-test.db"));

    let log = config.log.expect("log present");
    assert!(log.enabled);
    assert_eq!(log.level, 3);
    assert_eq!(log.resolved_dir().to_str(), Some("/tmp/maestro-logs"));

    let openai = config.llm.provider("openai").expect("openai present");
    assert_eq!(openai.api_key.as_deref(), Some("sk-test-key"));
    assert!(config.llm.provider("anthropic").is_none());
    assert_eq!(config.sandbox.mode, "docker");

    let mcp = config.mcp.expect("mcp present");
    let search = &mcp.servers["search"];
    assert_eq!(search.capabilities, vec!["web_search"]);
    assert_eq!(search.rate_limit.max_requests, 10);
    assert_eq!(search.backoff.base_delay_ms, 500);
    assert!(matches!(&search.transport, McpTransport::Stdio { command, .. } if command == "npx"));

    let cron = config.cron.expect("cron present");
    assert_eq!(cron.jobs.len(), 1);
    assert_eq!(cron.jobs[0].workflow_id, "report");
    assert_eq!(cron.jobs[0].input.as_ref().unwrap()["region"], "eu");
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("MAESTRO_TEST_API_KEY", "expanded-key-value");

    let config = load(
        r#"
[llm.anthropic]
api_key = "${MAESTRO_TEST_API_KEY}"
"#,
    );
    let anthropic = config.llm.provider("anthropic").expect("anthropic present");
    assert_eq!(anthropic.api_key.as_deref(), Some("expanded-key-value"));

    std::env::remove_var("MAESTRO_TEST_API_KEY");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let config = load("");

    assert_eq!(config.engine.max_in_flight, 8);
    assert_eq!(config.engine.execution_timeout_ms, 3_600_000);
    assert_eq!(config.engine.max_nesting_depth, 4);
    assert_eq!(config.sandbox.mode, "process");
    assert!(config.log.is_none());
    assert!(config.mcp.is_none());
    assert!(config.cron.is_none());
}

#[test]
fn test_http_transport_and_missing_file() {
    let config = load(
        r#"
[mcp.servers.crm.transport]
type = "http"
url = "http://localhost:3000/mcp"
"#,
    );
    let crm = &config.mcp.expect("mcp present").servers["crm"];
    assert!(matches!(&crm.transport, McpTransport::Http { url } if url.ends_with("/mcp")));
    assert_eq!(crm.timeout_secs, 120);

    let missing = AppConfig::load(std::path::Path::new("/nonexistent/maestro.toml"));
    assert!(matches!(missing, Err(MaestroError::ConfigNotFound(_))));
    let fallback = AppConfig::load_or_default(std::path::Path::new("/nonexistent/maestro.toml")).unwrap();
    assert_eq!(fallback.engine.max_in_flight, 8);
}

#[test]
fn test_invalid_toml_is_a_config_error() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[engine\nmax_in_flight = ").expect("write toml");
    assert!(matches!(AppConfig::load(tmp.path()), Err(MaestroError::Config(_))));
}
