use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use maestro_core::error::{MaestroError, Result};
use maestro_core::traits::{ExecutionStore, WorkflowStore};
use maestro_core::types::*;

use crate::{enum_from_str, enum_to_str};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS workflows (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    status TEXT NOT NULL,
    definition TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY,
    agent_type TEXT NOT NULL,
    definition TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS executions (
    id TEXT PRIMARY KEY,
    workflow_id TEXT NOT NULL,
    status TEXT NOT NULL,
    trigger_type TEXT NOT NULL,
    steps_total INTEGER NOT NULL,
    steps_completed INTEGER NOT NULL,
    steps_failed INTEGER NOT NULL,
    input_data TEXT NOT NULL,
    output_data TEXT,
    error_message TEXT,
    parent_execution_id TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_executions_workflow
    ON executions(workflow_id, created_at);

CREATE TABLE IF NOT EXISTS step_records (
    execution_id TEXT NOT NULL,
    step_key TEXT NOT NULL,
    attempt INTEGER NOT NULL,
    iteration INTEGER NOT NULL DEFAULT -1,
    status TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    output TEXT,
    error TEXT,
    PRIMARY KEY (execution_id, step_key, attempt, iteration)
);

CREATE TABLE IF NOT EXISTS execution_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    execution_id TEXT NOT NULL,
    step_key TEXT,
    attempt INTEGER,
    level TEXT NOT NULL,
    message TEXT NOT NULL,
    data TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_logs_execution ON execution_logs(execution_id, id);
";

fn db_err(e: impl std::fmt::Display) -> MaestroError {
    MaestroError::Database(e.to_string())
}

fn parse_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_json(s: Option<String>) -> Option<serde_json::Value> {
    s.and_then(|s| serde_json::from_str(&s).ok())
}

/// Raw `executions` row; decoded outside the rusqlite closure so enum and
/// JSON errors surface as `MaestroError`.
struct ExecutionRow {
    id: String,
    workflow_id: String,
    status: String,
    trigger_type: String,
    steps_total: u32,
    steps_completed: u32,
    steps_failed: u32,
    input_data: String,
    output_data: Option<String>,
    error_message: Option<String>,
    parent_execution_id: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

const EXECUTION_COLUMNS: &str = "id, workflow_id, status, trigger_type, steps_total, steps_completed,
     steps_failed, input_data, output_data, error_message, parent_execution_id,
     created_at, started_at, completed_at";

impl ExecutionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            workflow_id: row.get(1)?,
            status: row.get(2)?,
            trigger_type: row.get(3)?,
            steps_total: row.get(4)?,
            steps_completed: row.get(5)?,
            steps_failed: row.get(6)?,
            input_data: row.get(7)?,
            output_data: row.get(8)?,
            error_message: row.get(9)?,
            parent_execution_id: row.get(10)?,
            created_at: row.get(11)?,
            started_at: row.get(12)?,
            completed_at: row.get(13)?,
        })
    }

    fn decode(self) -> Result<Execution> {
        Ok(Execution {
            id: ExecutionId(self.id),
            workflow_id: self.workflow_id,
            status: enum_from_str(&self.status)?,
            trigger_type: enum_from_str(&self.trigger_type)?,
            steps_total: self.steps_total,
            steps_completed: self.steps_completed,
            steps_failed: self.steps_failed,
            input_data: serde_json::from_str(&self.input_data)?,
            output_data: parse_json(self.output_data),
            error_message: self.error_message,
            parent_execution_id: self.parent_execution_id.map(ExecutionId),
            created_at: parse_ts(Some(self.created_at)).unwrap_or_else(Utc::now),
            started_at: parse_ts(self.started_at),
            completed_at: parse_ts(self.completed_at),
        })
    }
}

/// SQLite-backed workflow and execution store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| db_err(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(db_err)
    }

    /// Insert or replace a workflow definition.
    pub fn save_workflow(&self, workflow: &Workflow) -> Result<()> {
        let definition = serde_json::to_string(workflow)?;
        let status = enum_to_str(&workflow.status)?;
        self.lock()?
            .execute(
                "INSERT INTO workflows (id, name, status, definition, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    status = excluded.status,
                    definition = excluded.definition,
                    updated_at = excluded.updated_at",
                params![workflow.id, workflow.name, status, definition, Utc::now().to_rfc3339()],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// Insert or replace an agent.
    pub fn save_agent(&self, agent: &Agent) -> Result<()> {
        let definition = serde_json::to_string(agent)?;
        let agent_type = enum_to_str(&agent.agent_type)?;
        self.lock()?
            .execute(
                "INSERT INTO agents (id, agent_type, definition, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    agent_type = excluded.agent_type,
                    definition = excluded.definition,
                    updated_at = excluded.updated_at",
                params![agent.id, agent_type, definition, Utc::now().to_rfc3339()],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn load_definition(&self, table: &str, id: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT definition FROM {} WHERE id = ?1", table),
            params![id],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)
    }
}

impl WorkflowStore for SqliteStore {
    fn get_workflow(&self, id: &str) -> BoxFuture<'_, Result<Option<Workflow>>> {
        let id = id.to_string();
        Box::pin(async move {
            match self.load_definition("workflows", &id)? {
                Some(json) => Ok(Some(serde_json::from_str(&json)?)),
                None => Ok(None),
            }
        })
    }

    fn get_agent(&self, id: &str) -> BoxFuture<'_, Result<Option<Agent>>> {
        let id = id.to_string();
        Box::pin(async move {
            match self.load_definition("agents", &id)? {
                Some(json) => Ok(Some(serde_json::from_str(&json)?)),
                None => Ok(None),
            }
        })
    }
}

impl ExecutionStore for SqliteStore {
    fn persist_execution(&self, execution: &Execution) -> BoxFuture<'_, Result<()>> {
        let exec = execution.clone();
        Box::pin(async move {
            let status = enum_to_str(&exec.status)?;
            let trigger = enum_to_str(&exec.trigger_type)?;
            let input = serde_json::to_string(&exec.input_data)?;
            let output = exec
                .output_data
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;

            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO executions (id, workflow_id, status, trigger_type, steps_total,
                    steps_completed, steps_failed, input_data, output_data, error_message,
                    parent_execution_id, created_at, started_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    steps_total = excluded.steps_total,
                    steps_completed = excluded.steps_completed,
                    steps_failed = excluded.steps_failed,
                    output_data = excluded.output_data,
                    error_message = excluded.error_message,
                    started_at = excluded.started_at,
                    completed_at = excluded.completed_at",
                params![
                    exec.id.as_str(),
                    exec.workflow_id,
                    status,
                    trigger,
                    exec.steps_total,
                    exec.steps_completed,
                    exec.steps_failed,
                    input,
                    output,
                    exec.error_message,
                    exec.parent_execution_id.as_ref().map(|p| p.as_str()),
                    exec.created_at.to_rfc3339(),
                    exec.started_at.map(|t| t.to_rfc3339()),
                    exec.completed_at.map(|t| t.to_rfc3339()),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn persist_step_record(&self, record: &StepExecutionRecord) -> BoxFuture<'_, Result<()>> {
        let record = record.clone();
        Box::pin(async move {
            let status = enum_to_str(&record.status)?;
            let output = record.output.as_ref().map(serde_json::to_string).transpose()?;
            let iteration = record.iteration.map(|i| i as i64).unwrap_or(-1);

            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO step_records (execution_id, step_key, attempt, iteration, status,
                    started_at, completed_at, output, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(execution_id, step_key, attempt, iteration) DO UPDATE SET
                    status = excluded.status,
                    started_at = excluded.started_at,
                    completed_at = excluded.completed_at,
                    output = excluded.output,
                    error = excluded.error",
                params![
                    record.execution_id.as_str(),
                    record.step_key,
                    record.attempt,
                    iteration,
                    status,
                    record.started_at.map(|t| t.to_rfc3339()),
                    record.completed_at.map(|t| t.to_rfc3339()),
                    output,
                    record.error,
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn append_execution_log(&self, entry: &ExecutionLogEntry) -> BoxFuture<'_, Result<()>> {
        let entry = entry.clone();
        Box::pin(async move {
            let data = serde_json::to_string(&entry.data)?;
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO execution_logs (execution_id, step_key, attempt, level, message, data, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry.execution_id.as_str(),
                    entry.step_key,
                    entry.attempt,
                    entry.level.as_str(),
                    entry.message,
                    data,
                    entry.created_at.to_rfc3339(),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn get_execution(&self, id: &ExecutionId) -> BoxFuture<'_, Result<Option<Execution>>> {
        let id = id.clone();
        Box::pin(async move {
            let row = {
                let conn = self.lock()?;
                conn.query_row(
                    &format!("SELECT {} FROM executions WHERE id = ?1", EXECUTION_COLUMNS),
                    params![id.as_str()],
                    ExecutionRow::from_row,
                )
                .optional()
                .map_err(db_err)?
            };
            row.map(ExecutionRow::decode).transpose()
        })
    }

    fn list_executions(&self, workflow_id: &str) -> BoxFuture<'_, Result<Vec<Execution>>> {
        let workflow_id = workflow_id.to_string();
        Box::pin(async move {
            let rows = {
                let conn = self.lock()?;
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {} FROM executions WHERE workflow_id = ?1
                         ORDER BY created_at DESC, rowid DESC",
                        EXECUTION_COLUMNS
                    ))
                    .map_err(db_err)?;
                let rows = stmt
                    .query_map(params![workflow_id], ExecutionRow::from_row)
                    .map_err(db_err)?;
                rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)?
            };
            rows.into_iter().map(ExecutionRow::decode).collect()
        })
    }

    fn list_execution_logs(&self, id: &ExecutionId) -> BoxFuture<'_, Result<Vec<ExecutionLogEntry>>> {
        let id = id.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(
                    "SELECT step_key, attempt, level, message, data, created_at
                     FROM execution_logs WHERE execution_id = ?1 ORDER BY id ASC",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![id.as_str()], |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<u32>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                })
                .map_err(db_err)?;

            let mut entries = Vec::new();
            for row in rows {
                let (step_key, attempt, level, message, data, created_at) = row.map_err(db_err)?;
                entries.push(ExecutionLogEntry {
                    execution_id: id.clone(),
                    step_key,
                    attempt,
                    level: LogLevel::parse(&level).unwrap_or(LogLevel::Info),
                    message,
                    data: serde_json::from_str(&data).unwrap_or(serde_json::Value::Null),
                    created_at: parse_ts(Some(created_at)).unwrap_or_else(Utc::now),
                });
            }
            Ok(entries)
        })
    }

    fn list_step_records(&self, id: &ExecutionId) -> BoxFuture<'_, Result<Vec<StepExecutionRecord>>> {
        let id = id.clone();
        Box::pin(async move {
            let rows = {
                let conn = self.lock()?;
                let mut stmt = conn
                    .prepare(
                        "SELECT step_key, attempt, iteration, status, started_at, completed_at, output, error
                         FROM step_records WHERE execution_id = ?1 ORDER BY rowid ASC",
                    )
                    .map_err(db_err)?;
                let rows = stmt
                    .query_map(params![id.as_str()], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, u32>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, Option<String>>(4)?,
                            row.get::<_, Option<String>>(5)?,
                            row.get::<_, Option<String>>(6)?,
                            row.get::<_, Option<String>>(7)?,
                        ))
                    })
                    .map_err(db_err)?;
                rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)?
            };

            rows.into_iter()
                .map(|(step_key, attempt, iteration, status, started, completed, output, error)| {
                    Ok(StepExecutionRecord {
                        execution_id: id.clone(),
                        step_key,
                        attempt,
                        iteration: (iteration >= 0).then_some(iteration as usize),
                        status: enum_from_str(&status)?,
                        started_at: parse_ts(started),
                        completed_at: parse_ts(completed),
                        output: parse_json(output),
                        error,
                    })
                })
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_workflow() -> Workflow {
        Workflow::new(
            "wf-1",
            vec![WorkflowStep::agent("fetch", "http"), WorkflowStep::agent("sum", "calc")
                .with_depends_on(&["fetch"])],
        )
    }

    #[tokio::test]
    async fn test_workflow_and_agent_roundtrip() {
        let store = SqliteStore::in_memory().unwrap();
        store.save_workflow(&sample_workflow()).unwrap();
        store
            .save_agent(&Agent::new("http", AgentType::Api).with_config(json!({ "url": "http://x" })))
            .unwrap();

        let wf = store.get_workflow("wf-1").await.unwrap().unwrap();
        assert_eq!(wf.steps.len(), 2);
        assert_eq!(wf.steps[1].depends_on, vec!["fetch".to_string()]);
        let agent = store.get_agent("http").await.unwrap().unwrap();
        assert_eq!(agent.config_str("url"), Some("http://x"));
        assert!(store.get_workflow("nope").await.unwrap().is_none());

        let mut renamed = sample_workflow();
        renamed.name = "renamed".into();
        store.save_workflow(&renamed).unwrap();
        assert_eq!(store.get_workflow("wf-1").await.unwrap().unwrap().name, "renamed");
    }

    #[tokio::test]
    async fn test_execution_upsert_keeps_single_row() {
        let store = SqliteStore::in_memory().unwrap();
        let mut exec = Execution::new("wf-1", TriggerType::Api, json!({ "n": 1 }), 2);
        store.persist_execution(&exec).await.unwrap();

        exec.status = ExecutionStatus::Completed;
        exec.steps_completed = 2;
        exec.output_data = Some(json!({ "sum": 3 }));
        exec.completed_at = Some(Utc::now());
        store.persist_execution(&exec).await.unwrap();

        let loaded = store.get_execution(&exec.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Completed);
        assert_eq!(loaded.trigger_type, TriggerType::Api);
        assert_eq!(loaded.steps_completed, 2);
        assert_eq!(loaded.input_data, json!({ "n": 1 }));
        assert_eq!(loaded.output_data, Some(json!({ "sum": 3 })));
        assert_eq!(store.list_executions("wf-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_executions_newest_first() {
        let store = SqliteStore::in_memory().unwrap();
        let first = Execution::new("wf-1", TriggerType::Manual, json!({}), 1);
        let mut second = Execution::new("wf-1", TriggerType::Manual, json!({}), 1);
        second.created_at = first.created_at + chrono::Duration::seconds(1);
        store.persist_execution(&first).await.unwrap();
        store.persist_execution(&second).await.unwrap();
        store
            .persist_execution(&Execution::new("wf-2", TriggerType::Manual, json!({}), 1))
            .await
            .unwrap();

        let list = store.list_executions("wf-1").await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, second.id);
    }

    #[tokio::test]
    async fn test_step_records_update_in_place() {
        let store = SqliteStore::in_memory().unwrap();
        let id = ExecutionId::new();

        let running = StepExecutionRecord::started(&id, "fetch", 1);
        store.persist_step_record(&running).await.unwrap();
        store
            .persist_step_record(&running.clone().fail("boom"))
            .await
            .unwrap();
        let second = StepExecutionRecord::started(&id, "fetch", 2).complete(json!([1, 2]));
        store.persist_step_record(&second).await.unwrap();
        let mut looped = StepExecutionRecord::started(&id, "child", 1).complete(json!("x"));
        looped.iteration = Some(0);
        store.persist_step_record(&looped).await.unwrap();

        let records = store.list_step_records(&id).await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].status, StepStatus::Failed);
        assert_eq!(records[0].error.as_deref(), Some("boom"));
        assert_eq!(records[1].output, Some(json!([1, 2])));
        assert_eq!(records[2].iteration, Some(0));
        assert_eq!(records[0].iteration, None);
    }

    #[tokio::test]
    async fn test_logs_in_append_order() {
        let store = SqliteStore::in_memory().unwrap();
        let id = ExecutionId::new();
        for (i, level) in [LogLevel::Info, LogLevel::Warn, LogLevel::Error].iter().enumerate() {
            let entry = ExecutionLogEntry::new(&id, *level, format!("line {}", i))
                .for_step("fetch", Some(1))
                .with_data(json!({ "i": i }));
            store.append_execution_log(&entry).await.unwrap();
        }

        let logs = store.list_execution_logs(&id).await.unwrap();
        assert_eq!(logs.len(), 3);
        assert_eq!(logs[1].level, LogLevel::Warn);
        assert_eq!(logs[2].message, "line 2");
        assert_eq!(logs[2].data["i"], 2);
        assert_eq!(logs[0].attempt, Some(1));
        assert!(store.list_execution_logs(&ExecutionId::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_on_disk_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("maestro.db");
        let exec = Execution::new("wf-disk", TriggerType::Scheduled, json!(null), 0);
        {
            let store = SqliteStore::open(&path).unwrap();
            store.persist_execution(&exec).await.unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        let loaded = store.get_execution(&exec.id).await.unwrap().unwrap();
        assert_eq!(loaded.trigger_type, TriggerType::Scheduled);
    }
}
