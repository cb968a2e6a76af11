//! Workflow execution engine.
//!
//! A workflow's steps form a DAG ([`StepGraph`]). For each execution the
//! [`Scheduler`] launches ready steps onto a `JoinSet` and settles every
//! result on the execution's [`ExecutionTrace`]. AGENT steps go through the
//! [`StepRunner`]; control steps are handled in `flow`.

pub mod condition;
pub mod control;
pub mod engine;
mod flow;
pub mod graph;
pub mod limits;
pub mod run_log;
pub mod runner;
pub mod scheduler;
pub mod trace;
pub mod trigger;

pub use engine::WorkflowEngine;
pub use graph::StepGraph;
pub use limits::AgentLimiter;
pub use run_log::RunLogger;
pub use runner::{Disposition, StepContext, StepRun, StepRunner};
pub use scheduler::{CancelOutcome, ExecuteOptions, Scheduler};
pub use trace::ExecutionTrace;
pub use trigger::CronTrigger;
