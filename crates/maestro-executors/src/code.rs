use std::process::Stdio;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use maestro_core::config::SandboxConfig;
use maestro_core::error::ExecutorError;
use maestro_core::traits::{check_agent_type, require_config, AgentExecutor, ExecutorInput};
use maestro_core::types::*;

use crate::parse_config;

const MAX_CAPTURE: usize = 30_000;

/// Runs agent code with an existing interpreter, in a child process or a
/// docker container.
pub struct CodeExecutor {
    sandbox: SandboxConfig,
    metrics: Option<ExecutionMetrics>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CodeConfig {
    language: String,
    code: String,
    #[serde(default)]
    sandbox: Option<String>,
    #[serde(default)]
    image: Option<String>,
}

/// What the child left behind.
#[derive(Debug, Default)]
struct RunOutput {
    exit_code: Option<i32>,
    killed: bool,
    timed_out: bool,
    stdout: String,
    stderr: String,
}

fn interpreter(language: &str) -> Result<(&'static str, &'static str), ExecutorError> {
    match language {
        "python" | "python3" => Ok(("python3", "-c")),
        "javascript" | "js" | "node" => Ok(("node", "-e")),
        "bash" => Ok(("bash", "-c")),
        "sh" => Ok(("sh", "-c")),
        other => Err(ExecutorError::InvalidConfig(format!(
            "unsupported language '{}'",
            other
        ))),
    }
}

fn is_syntax_error(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("syntaxerror") || lower.contains("indentationerror") || lower.contains("syntax error")
}

fn truncate(mut s: String) -> String {
    if s.len() > MAX_CAPTURE {
        let mut cut = MAX_CAPTURE;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push_str("\n... (output truncated)");
    }
    s
}

/// Map a finished run onto the executor's result or error.
fn interpret(run: RunOutput, agent: &Agent) -> Result<ExecutionResult, ExecutorError> {
    if run.timed_out {
        return Err(ExecutorError::ResourceLimitExceeded(format!(
            "execution exceeded {}ms",
            agent.max_execution_time_ms
        )));
    }
    if run.killed || run.exit_code == Some(137) {
        return Err(ExecutorError::ResourceLimitExceeded(format!(
            "process killed (memory limit {}MB)",
            agent.max_memory_mb
        )));
    }
    if run.exit_code != Some(0) {
        let message = if run.stderr.trim().is_empty() {
            run.stdout.trim().to_string()
        } else {
            run.stderr.trim().to_string()
        };
        if is_syntax_error(&run.stderr) {
            return Err(ExecutorError::CompileError(message));
        }
        return Err(ExecutorError::CodeRuntime {
            exit_code: run.exit_code,
            message,
        });
    }

    let result = run
        .stdout
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .and_then(|l| serde_json::from_str::<serde_json::Value>(l.trim()).ok());

    let mut output = json!({
        "stdout": run.stdout,
        "stderr": run.stderr,
        "exitCode": 0,
    });
    if let Some(result) = result {
        output["result"] = result;
    }

    let mut res = ExecutionResult::new(output);
    if !run.stderr.trim().is_empty() {
        res = res.with_log(ExecutorLog::warn("code wrote to stderr").with_data(json!(run.stderr)));
    }
    Ok(res)
}

/// Runs a cleanup future on a spawned task if dropped while armed, so a
/// cancelled or timed-out caller does not leave a container behind.
struct CleanupOnDrop {
    cleanup: Option<BoxFuture<'static, ()>>,
}

impl CleanupOnDrop {
    fn new(cleanup: BoxFuture<'static, ()>) -> Self {
        Self {
            cleanup: Some(cleanup),
        }
    }

    fn disarm(&mut self) {
        self.cleanup = None;
    }
}

impl Drop for CleanupOnDrop {
    fn drop(&mut self) {
        let Some(cleanup) = self.cleanup.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(cleanup);
            }
            Err(_) => warn!("No runtime to clean up an abandoned container"),
        }
    }
}

fn remove_container(docker: bollard::Docker, id: String) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let options = bollard::container::RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = docker.remove_container(&id, Some(options)).await {
            warn!(container = %id, error = %e, "Failed to remove container");
        }
    })
}

impl CodeExecutor {
    pub fn new(sandbox: SandboxConfig) -> Self {
        Self {
            sandbox,
            metrics: None,
        }
    }

    async fn run_process(
        &self,
        config: &CodeConfig,
        agent: &Agent,
        inputs_json: &str,
        deadline: Duration,
    ) -> Result<RunOutput, ExecutorError> {
        let (program, flag) = interpreter(&config.language)?;

        // V8 reserves far more address space than it uses, so node runs
        // without a virtual memory cap.
        let mut cmd = if program == "node" {
            let mut cmd = tokio::process::Command::new(program);
            cmd.arg(flag).arg(&config.code);
            cmd
        } else {
            let mut cmd = tokio::process::Command::new("sh");
            cmd.arg("-c")
                .arg(format!(
                    "ulimit -v {} 2>/dev/null; exec \"$@\"",
                    agent.max_memory_mb * 1024
                ))
                .arg("maestro")
                .arg(program)
                .arg(flag)
                .arg(&config.code);
            cmd
        };
        cmd.env("MAESTRO_INPUTS", inputs_json)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.sandbox.work_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| ExecutorError::CodeRuntime {
            exit_code: None,
            message: format!("failed to start {}: {}", program, e),
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            let mut bytes = inputs_json.as_bytes().to_vec();
            bytes.push(b'\n');
            tokio::spawn(async move {
                // The script may exit without reading stdin.
                let _ = stdin.write_all(&bytes).await;
            });
        }

        match tokio::time::timeout(deadline, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                #[cfg(unix)]
                let killed = {
                    use std::os::unix::process::ExitStatusExt;
                    output.status.signal() == Some(9)
                };
                #[cfg(not(unix))]
                let killed = false;
                Ok(RunOutput {
                    exit_code: output.status.code(),
                    killed,
                    timed_out: false,
                    stdout: truncate(String::from_utf8_lossy(&output.stdout).to_string()),
                    stderr: truncate(String::from_utf8_lossy(&output.stderr).to_string()),
                })
            }
            Ok(Err(e)) => Err(ExecutorError::CodeRuntime {
                exit_code: None,
                message: e.to_string(),
            }),
            // Dropping the child kills it.
            Err(_) => Ok(RunOutput {
                timed_out: true,
                ..Default::default()
            }),
        }
    }

    async fn run_docker(
        &self,
        config: &CodeConfig,
        agent: &Agent,
        inputs_json: &str,
        deadline: Duration,
    ) -> Result<RunOutput, ExecutorError> {
        let (program, flag) = interpreter(&config.language)?;
        let sandbox_err = |what: &str, e: bollard::errors::Error| ExecutorError::CodeRuntime {
            exit_code: None,
            message: format!("Docker {} failed: {}", what, e),
        };

        let docker = bollard::Docker::connect_with_local_defaults()
            .map_err(|e| sandbox_err("connect", e))?;

        let image = config
            .image
            .clone()
            .unwrap_or_else(|| self.sandbox.image.clone());
        let container_config = bollard::container::Config {
            image: Some(image),
            cmd: Some(vec![program.to_string(), flag.to_string(), config.code.clone()]),
            env: Some(vec![format!("MAESTRO_INPUTS={}", inputs_json)]),
            host_config: Some(bollard::models::HostConfig {
                memory: Some((agent.max_memory_mb as i64) * 1024 * 1024),
                network_mode: Some("none".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let container = docker
            .create_container::<&str, String>(None, container_config)
            .await
            .map_err(|e| sandbox_err("create", e))?;
        let mut guard = CleanupOnDrop::new(remove_container(docker.clone(), container.id.clone()));

        docker
            .start_container::<String>(&container.id, None)
            .await
            .map_err(|e| sandbox_err("start", e))?;

        let wait_result = tokio::time::timeout(deadline, async {
            let mut stream = docker.wait_container::<String>(
                &container.id,
                None::<bollard::container::WaitContainerOptions<String>>,
            );
            stream.next().await
        })
        .await;

        let mut run = RunOutput::default();
        match wait_result {
            Ok(Some(Ok(exit))) => run.exit_code = Some(exit.status_code as i32),
            Ok(Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. }))) => {
                run.exit_code = Some(code as i32)
            }
            Ok(Some(Err(e))) => {
                guard.disarm();
                remove_container(docker, container.id).await;
                return Err(sandbox_err("wait", e));
            }
            Ok(None) => run.exit_code = Some(0),
            Err(_) => {
                docker
                    .kill_container::<String>(&container.id, None)
                    .await
                    .ok();
                run.timed_out = true;
            }
        }

        let log_options = bollard::container::LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut log_stream = docker.logs(&container.id, Some(log_options));
        while let Some(Ok(log)) = log_stream.next().await {
            match log {
                bollard::container::LogOutput::StdErr { message } => {
                    run.stderr.push_str(&String::from_utf8_lossy(&message))
                }
                other => run.stdout.push_str(&other.to_string()),
            }
        }
        run.stdout = truncate(run.stdout);
        run.stderr = truncate(run.stderr);

        drop(log_stream);
        guard.disarm();
        remove_container(docker, container.id).await;

        Ok(run)
    }
}

impl AgentExecutor for CodeExecutor {
    fn agent_type(&self) -> AgentType {
        AgentType::Code
    }

    fn validate_input(&self, input: &ExecutorInput) -> Result<(), ExecutorError> {
        check_agent_type(AgentType::Code, &input.agent)?;
        require_config(&input.agent, &["language", "code"])?;
        let config: CodeConfig = parse_config(&input.agent)?;
        interpreter(&config.language)?;
        Ok(())
    }

    fn execute(
        &mut self,
        input: ExecutorInput,
    ) -> BoxFuture<'_, Result<ExecutionResult, ExecutorError>> {
        Box::pin(async move {
            let config: CodeConfig = parse_config(&input.agent)?;
            let inputs_json = serde_json::to_string(&input.inputs)
                .map_err(|e| ExecutorError::InvalidConfig(e.to_string()))?;
            let deadline = Duration::from_millis(input.agent.max_execution_time_ms);
            let mode = config
                .sandbox
                .clone()
                .unwrap_or_else(|| self.sandbox.mode.clone());

            debug!(
                agent_id = %input.agent.id,
                language = %config.language,
                mode = %mode,
                "Running code agent"
            );

            let started = Instant::now();
            let run = async {
                match mode.as_str() {
                    "process" => self.run_process(&config, &input.agent, &inputs_json, deadline).await,
                    "docker" => self.run_docker(&config, &input.agent, &inputs_json, deadline).await,
                    other => Err(ExecutorError::InvalidConfig(format!(
                        "unknown sandbox mode '{}'",
                        other
                    ))),
                }
            };
            let run = tokio::select! {
                r = run => r?,
                _ = input.context.cancel.cancelled() => return Err(ExecutorError::Cancelled),
            };

            self.metrics = Some(ExecutionMetrics {
                duration_ms: started.elapsed().as_millis() as u64,
                ..Default::default()
            });
            interpret(run, &input.agent)
        })
    }

    fn collect_metrics(&self) -> Option<ExecutionMetrics> {
        self.metrics.clone()
    }
}
