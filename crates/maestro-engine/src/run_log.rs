use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use maestro_core::event::{EventBus, ExecutionEvent};

/// JSONL audit log of executions.
///
/// Subscribes to the EventBus and appends one JSON object per line to
/// `{log_dir}/{execution_id}.jsonl`. Lines written before a crash stay
/// intact. Verbosity: 1 = execution start/finish, 2 = adds per-step results,
/// 3 = adds step attempts and execution log entries.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    execution_id: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    step_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    pub fn log_path(&self, execution_id: &str) -> PathBuf {
        self.log_dir.join(format!("{}.jsonl", execution_id))
    }

    /// Run until cancelled or the bus closes.
    pub async fn run(self, event_bus: Arc<EventBus>, cancel: CancellationToken) {
        let rx = event_bus.subscribe();
        self.run_with(rx, cancel).await
    }

    /// Subscribe now and log on a background task, so no event published
    /// after this call is missed.
    pub fn spawn(self, event_bus: &EventBus, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let rx = event_bus.subscribe();
        tokio::spawn(self.run_with(rx, cancel))
    }

    async fn run_with(self, mut rx: broadcast::Receiver<ExecutionEvent>, cancel: CancellationToken) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }
        info!(dir = %self.log_dir.display(), level = self.level, "RunLogger started");

        let mut writers: HashMap<String, BufWriter<File>> = HashMap::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => match result {
                    Ok(event) => self.handle(&mut writers, &event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "RunLogger lagged, skipped events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("EventBus closed, RunLogger stopping");
                        break;
                    }
                },
            }
        }

        for (_, mut writer) in writers.drain() {
            writer.flush().await.ok();
        }
        debug!("RunLogger finished");
    }

    async fn handle(&self, writers: &mut HashMap<String, BufWriter<File>>, event: &ExecutionEvent) {
        let id = event.execution_id().to_string();
        if matches!(event, ExecutionEvent::ExecutionStarted { .. }) {
            match open(&self.log_path(&id)).await {
                Ok(writer) => {
                    writers.insert(id.clone(), writer);
                }
                Err(e) => {
                    error!(error = %e, execution_id = %id, "Failed to open run log");
                    return;
                }
            }
        }

        let Some(entry) = self.event_to_entry(event) else {
            return;
        };
        let Some(writer) = writers.get_mut(&id) else {
            return;
        };
        if let Ok(json) = serde_json::to_string(&entry) {
            let line = format!("{}\n", json);
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                error!(error = %e, execution_id = %id, "Failed to write log entry");
            }
            if let Err(e) = writer.flush().await {
                error!(error = %e, execution_id = %id, "Failed to flush log");
            }
        }

        if matches!(event, ExecutionEvent::ExecutionFinished { .. }) {
            writers.remove(&id);
        }
    }

    /// Convert an event to a log line, or None if filtered by level.
    fn event_to_entry(&self, event: &ExecutionEvent) -> Option<LogEntry> {
        let entry = |event_type, step_key: Option<&str>, detail| LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            execution_id: event.execution_id().to_string(),
            event_type,
            step_key: step_key.map(str::to_string),
            detail: Some(detail),
        };

        match event {
            // L1: execution summary
            ExecutionEvent::ExecutionStarted {
                workflow_id,
                steps_total,
                ..
            } => Some(entry(
                "execution_started",
                None,
                serde_json::json!({ "workflow_id": workflow_id, "steps_total": steps_total }),
            )),
            ExecutionEvent::ExecutionFinished {
                status,
                steps_completed,
                steps_failed,
                error,
                ..
            } => Some(entry(
                "execution_finished",
                None,
                serde_json::json!({
                    "status": status,
                    "steps_completed": steps_completed,
                    "steps_failed": steps_failed,
                    "error": error,
                }),
            )),

            // L2: per-step results
            ExecutionEvent::StepFinished {
                step_key,
                status,
                attempts,
                ..
            } if self.level >= 2 => Some(entry(
                "step_finished",
                Some(step_key.as_str()),
                serde_json::json!({ "status": status, "attempts": attempts }),
            )),

            // L3: attempts and trace entries
            ExecutionEvent::StepStarted {
                step_key, attempt, ..
            } if self.level >= 3 => Some(entry(
                "step_started",
                Some(step_key.as_str()),
                serde_json::json!({ "attempt": attempt }),
            )),
            ExecutionEvent::Log {
                step_key,
                level,
                message,
                ..
            } if self.level >= 3 => Some(entry(
                "log",
                step_key.as_deref(),
                serde_json::json!({ "level": level, "message": truncate_str(message, 500) }),
            )),

            _ => None,
        }
    }
}

async fn open(path: &Path) -> std::io::Result<BufWriter<File>> {
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    Ok(BufWriter::new(file))
}

fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_core::types::{ExecutionId, ExecutionStatus, LogLevel, StepStatus};

    fn started(id: &ExecutionId) -> ExecutionEvent {
        ExecutionEvent::ExecutionStarted {
            execution_id: id.clone(),
            workflow_id: "wf".into(),
            steps_total: 2,
        }
    }

    fn step_finished(id: &ExecutionId) -> ExecutionEvent {
        ExecutionEvent::StepFinished {
            execution_id: id.clone(),
            step_key: "a".into(),
            status: StepStatus::Completed,
            attempts: 1,
        }
    }

    #[test]
    fn test_event_level_filtering() {
        let id = ExecutionId::new();
        let log = ExecutionEvent::Log {
            execution_id: id.clone(),
            step_key: Some("a".into()),
            level: LogLevel::Info,
            message: "hi".into(),
        };

        let l1 = RunLogger::new(PathBuf::from("/tmp"), 1);
        assert!(l1.event_to_entry(&started(&id)).is_some());
        assert!(l1.event_to_entry(&step_finished(&id)).is_none());
        assert!(l1.event_to_entry(&log).is_none());

        let l2 = RunLogger::new(PathBuf::from("/tmp"), 2);
        assert!(l2.event_to_entry(&step_finished(&id)).is_some());
        assert!(l2.event_to_entry(&log).is_none());

        let l3 = RunLogger::new(PathBuf::from("/tmp"), 3);
        let entry = l3.event_to_entry(&log).unwrap();
        assert_eq!(entry.step_key.as_deref(), Some("a"));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_str("short", 10), "short");
        assert_eq!(truncate_str("héllo", 2), "h");
    }

    #[tokio::test]
    async fn test_writes_one_file_per_execution() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::new(16));
        let cancel = CancellationToken::new();
        let logger = RunLogger::new(dir.path().to_path_buf(), 2);
        let path = logger.log_path("x");
        let handle = logger.spawn(&bus, cancel.clone());

        let id = ExecutionId::from_string("x");
        bus.publish(started(&id));
        bus.publish(step_finished(&id));
        bus.publish(ExecutionEvent::ExecutionFinished {
            execution_id: id.clone(),
            status: ExecutionStatus::Completed,
            steps_completed: 1,
            steps_failed: 0,
            error: None,
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        let contents = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("execution_started"));
        assert!(lines[2].contains("COMPLETED"));
    }
}
