use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use maestro_core::error::ValidationError;
use maestro_core::types::{StepType, WorkflowStep};

use crate::condition::Expr;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionConfig {
    pub expression: String,
    #[serde(default)]
    pub true_branch: Vec<String>,
    #[serde(default)]
    pub false_branch: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopConfig {
    /// A literal array or a `{{path}}` reference resolved against the scope.
    pub items: Value,
    pub children: Vec<String>,
    #[serde(default = "default_item_var")]
    pub item_var: String,
    /// Iterations allowed to run at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_item_var() -> String {
    "item".to_string()
}

fn default_concurrency() -> usize {
    1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelConfig {
    pub children: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitConfig {
    pub duration_ms: u64,
}

/// A step's typed behavior, parsed once when the graph is built.
#[derive(Debug, Clone)]
pub enum StepSpec {
    Agent,
    Condition { config: ConditionConfig, expr: Expr },
    Loop(LoopConfig),
    Parallel(ParallelConfig),
    Wait(WaitConfig),
}

fn invalid(step: &WorkflowStep, reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidControlStep {
        step: step.step_key.clone(),
        step_type: step.step_type.to_string(),
        reason: reason.into(),
    }
}

fn parse_config<T: DeserializeOwned>(step: &WorkflowStep) -> Result<T, ValidationError> {
    serde_json::from_value(Value::Object(step.config.clone())).map_err(|e| invalid(step, e.to_string()))
}

impl StepSpec {
    pub fn parse(step: &WorkflowStep) -> Result<Self, ValidationError> {
        match step.step_type {
            StepType::Agent => Ok(StepSpec::Agent),
            StepType::Condition => {
                let config: ConditionConfig = parse_config(step)?;
                let expr = Expr::parse(&config.expression).map_err(|e| invalid(step, e))?;
                if let Some(key) = config.true_branch.iter().find(|k| config.false_branch.contains(k)) {
                    return Err(invalid(step, format!("step '{}' is in both branches", key)));
                }
                Ok(StepSpec::Condition { config, expr })
            }
            StepType::Loop => {
                let config: LoopConfig = parse_config(step)?;
                if config.children.is_empty() {
                    return Err(invalid(step, "children must not be empty"));
                }
                if config.concurrency == 0 {
                    return Err(invalid(step, "concurrency must be at least 1"));
                }
                match &config.items {
                    Value::Array(_) | Value::String(_) => Ok(StepSpec::Loop(config)),
                    _ => Err(invalid(step, "items must be an array or a {{path}} reference")),
                }
            }
            StepType::Parallel => {
                let config: ParallelConfig = parse_config(step)?;
                if config.children.is_empty() {
                    return Err(invalid(step, "children must not be empty"));
                }
                Ok(StepSpec::Parallel(config))
            }
            StepType::Wait => Ok(StepSpec::Wait(parse_config(step)?)),
        }
    }

    /// Steps run by this step rather than by the scheduler.
    pub fn children(&self) -> &[String] {
        match self {
            StepSpec::Loop(config) => config.children.as_slice(),
            StepSpec::Parallel(config) => config.children.as_slice(),
            _ => &[],
        }
    }

    /// Steps this CONDITION routes between.
    pub fn branches(&self) -> Option<(&[String], &[String])> {
        match self {
            StepSpec::Condition { config, .. } => Some((config.true_branch.as_slice(), config.false_branch.as_slice())),
            _ => None,
        }
    }
}
