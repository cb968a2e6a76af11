use std::cmp::Ordering;
use std::collections::BTreeMap;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use maestro_core::error::ExecutorError;
use maestro_core::template::{lookup_path, resolve_value};
use maestro_core::traits::{check_agent_type, require_config, AgentExecutor, ExecutorInput};
use maestro_core::types::*;

use crate::parse_config;

/// Runs a filter/sort/aggregate/select/limit pipeline over an array of rows.
#[derive(Default)]
pub struct DataExecutor {
    metrics: Option<ExecutionMetrics>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DataConfig {
    #[serde(default)]
    source: Option<String>,
    operations: Vec<Operation>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum Operation {
    Filter {
        field: String,
        #[serde(default = "default_filter_op")]
        op: String,
        #[serde(default)]
        value: Value,
    },
    Sort {
        field: String,
        #[serde(default = "default_order")]
        order: String,
    },
    #[serde(rename_all = "camelCase")]
    Aggregate {
        operation: String,
        #[serde(default)]
        field: Option<String>,
        #[serde(default)]
        group_by: Option<String>,
    },
    Select {
        fields: Vec<String>,
    },
    Limit {
        count: usize,
    },
}

fn default_filter_op() -> String {
    "eq".into()
}
fn default_order() -> String {
    "asc".into()
}

fn pipeline_err(msg: impl Into<String>) -> ExecutorError {
    ExecutorError::DataPipeline(msg.into())
}

/// Order JSON scalars: numbers numerically, strings lexically, nulls last.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Greater,
        (_, Value::Null) => Ordering::Less,
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

fn field<'a>(row: &'a Value, path: &str) -> &'a Value {
    lookup_path(row, path).unwrap_or(&Value::Null)
}

fn matches(row: &Value, path: &str, op: &str, expected: &Value) -> Result<bool, ExecutorError> {
    let actual = field(row, path);
    Ok(match op {
        "eq" | "==" => actual == expected,
        "ne" | "!=" => actual != expected,
        "gt" | ">" => !actual.is_null() && compare_values(actual, expected) == Ordering::Greater,
        "gte" | ">=" => !actual.is_null() && compare_values(actual, expected) != Ordering::Less,
        "lt" | "<" => !actual.is_null() && compare_values(actual, expected) == Ordering::Less,
        "lte" | "<=" => !actual.is_null() && compare_values(actual, expected) != Ordering::Greater,
        "contains" => match (actual, expected) {
            (Value::String(s), Value::String(needle)) => s.contains(needle.as_str()),
            (Value::Array(items), needle) => items.contains(needle),
            _ => false,
        },
        "exists" => !actual.is_null(),
        other => return Err(pipeline_err(format!("unknown filter op '{}'", other))),
    })
}

fn aggregate(rows: &[Value], operation: &str, path: Option<&str>) -> Result<Value, ExecutorError> {
    if operation == "count" {
        return Ok(json!(rows.len()));
    }
    let path = path.ok_or_else(|| pipeline_err(format!("aggregate '{}' needs a field", operation)))?;
    let numbers: Vec<f64> = rows.iter().filter_map(|r| field(r, path).as_f64()).collect();
    Ok(match operation {
        "sum" => json!(numbers.iter().sum::<f64>()),
        "avg" if numbers.is_empty() => Value::Null,
        "avg" => json!(numbers.iter().sum::<f64>() / numbers.len() as f64),
        "min" => numbers
            .iter()
            .copied()
            .fold(None, |acc: Option<f64>, n| Some(acc.map_or(n, |a| a.min(n))))
            .map(|n| json!(n))
            .unwrap_or(Value::Null),
        "max" => numbers
            .iter()
            .copied()
            .fold(None, |acc: Option<f64>, n| Some(acc.map_or(n, |a| a.max(n))))
            .map(|n| json!(n))
            .unwrap_or(Value::Null),
        other => return Err(pipeline_err(format!("unknown aggregate '{}'", other))),
    })
}

fn apply(rows: Vec<Value>, op: &Operation) -> Result<Vec<Value>, ExecutorError> {
    match op {
        Operation::Filter { field: path, op, value } => {
            let mut out = Vec::with_capacity(rows.len());
            for row in rows {
                if matches(&row, path, op, value)? {
                    out.push(row);
                }
            }
            Ok(out)
        }
        Operation::Sort { field: path, order } => {
            let mut rows = rows;
            let descending = match order.as_str() {
                "asc" => false,
                "desc" => true,
                other => return Err(pipeline_err(format!("unknown sort order '{}'", other))),
            };
            // Nulls sort last in either direction.
            rows.sort_by(|a, b| {
                let (x, y) = (field(a, path), field(b, path));
                let ord = compare_values(x, y);
                if descending && !x.is_null() && !y.is_null() {
                    ord.reverse()
                } else {
                    ord
                }
            });
            Ok(rows)
        }
        Operation::Aggregate {
            operation,
            field: path,
            group_by,
        } => match group_by {
            None => {
                let value = aggregate(&rows, operation, path.as_deref())?;
                let mut out = Map::new();
                out.insert(operation.clone(), value);
                Ok(vec![Value::Object(out)])
            }
            Some(key) => {
                let mut groups: BTreeMap<String, (Value, Vec<Value>)> = BTreeMap::new();
                for row in rows {
                    let group = field(&row, key).clone();
                    groups
                        .entry(group.to_string())
                        .or_insert_with(|| (group, Vec::new()))
                        .1
                        .push(row);
                }
                groups
                    .into_values()
                    .map(|(group, members)| {
                        let value = aggregate(&members, operation, path.as_deref())?;
                        let mut out = Map::new();
                        out.insert(key.clone(), group);
                        out.insert(operation.clone(), value);
                        Ok(Value::Object(out))
                    })
                    .collect()
            }
        },
        Operation::Select { fields } => Ok(rows
            .iter()
            .map(|row| {
                let projected: Map<String, Value> = fields
                    .iter()
                    .map(|f| (f.clone(), field(row, f).clone()))
                    .collect();
                Value::Object(projected)
            })
            .collect()),
        Operation::Limit { count } => Ok(rows.into_iter().take(*count).collect()),
    }
}

/// Resolve the rows a pipeline runs over: a `{{path}}` template, a plain
/// input key, or the `data` input when no source is given.
fn load_source(source: Option<&str>, inputs: &JsonMap) -> Result<Vec<Value>, ExecutorError> {
    let vars = Value::Object(inputs.clone());
    let value = match source {
        Some(s) if s.contains("{{") => resolve_value(&Value::String(s.to_string()), &vars),
        Some(key) => lookup_path(&vars, key).cloned().unwrap_or(Value::Null),
        None => inputs.get("data").cloned().unwrap_or(Value::Null),
    };
    match value {
        Value::Array(rows) => Ok(rows),
        Value::Null => Err(pipeline_err("source resolved to nothing")),
        other => Err(pipeline_err(format!("source is not an array: {}", other))),
    }
}

impl DataExecutor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AgentExecutor for DataExecutor {
    fn agent_type(&self) -> AgentType {
        AgentType::Data
    }

    fn validate_input(&self, input: &ExecutorInput) -> Result<(), ExecutorError> {
        check_agent_type(AgentType::Data, &input.agent)?;
        require_config(&input.agent, &["operations"])?;
        parse_config::<DataConfig>(&input.agent)?;
        Ok(())
    }

    fn execute(
        &mut self,
        input: ExecutorInput,
    ) -> BoxFuture<'_, Result<ExecutionResult, ExecutorError>> {
        Box::pin(async move {
            let started = std::time::Instant::now();
            let config: DataConfig = parse_config(&input.agent)?;
            let mut rows = load_source(config.source.as_deref(), &input.inputs)?;
            let input_count = rows.len();
            for op in &config.operations {
                rows = apply(rows, op)?;
            }
            self.metrics = Some(ExecutionMetrics {
                duration_ms: started.elapsed().as_millis() as u64,
                ..Default::default()
            });
            Ok(ExecutionResult::new(json!({
                "count": rows.len(),
                "inputCount": input_count,
                "result": rows,
            })))
        })
    }

    fn collect_metrics(&self) -> Option<ExecutionMetrics> {
        self.metrics.clone()
    }
}
