//! Persistence for workflow definitions and execution history.
//!
//! Both stores implement [`WorkflowStore`](maestro_core::traits::WorkflowStore)
//! and [`ExecutionStore`](maestro_core::traits::ExecutionStore). Executions are
//! listed newest first; step records and logs come back in insertion order.

mod bundle;
mod memory;
mod sqlite;

pub use bundle::WorkflowBundle;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use serde::de::DeserializeOwned;
use serde::Serialize;

use maestro_core::error::{MaestroError, Result};

/// Wire name of a unit enum variant (`COMPLETED`, `MANUAL`, ...).
pub(crate) fn enum_to_str<T: Serialize>(value: &T) -> Result<String> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(MaestroError::Database(format!(
            "expected a string-encoded enum, got {}",
            other
        ))),
    }
}

pub(crate) fn enum_from_str<T: DeserializeOwned>(s: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|e| MaestroError::Database(format!("bad enum value '{}': {}", s, e)))
}
