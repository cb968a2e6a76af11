use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use maestro_core::config::CronConfig;
use maestro_core::types::TriggerType;

use crate::engine::WorkflowEngine;

struct CronJob {
    name: String,
    schedule: Schedule,
    workflow_id: String,
    input: Value,
}

/// Fires workflows on cron schedules.
pub struct CronTrigger {
    jobs: Vec<CronJob>,
    engine: Arc<WorkflowEngine>,
    cancel: CancellationToken,
}

impl CronTrigger {
    pub fn new(config: &CronConfig, engine: Arc<WorkflowEngine>, cancel: CancellationToken) -> Self {
        let mut jobs = Vec::new();

        for job_config in &config.jobs {
            match Schedule::from_str(&job_config.schedule) {
                Ok(schedule) => {
                    jobs.push(CronJob {
                        name: job_config.name.clone(),
                        schedule,
                        workflow_id: job_config.workflow_id.clone(),
                        input: job_config.input.clone().unwrap_or(Value::Object(Default::default())),
                    });
                    info!(
                        name = %job_config.name,
                        schedule = %job_config.schedule,
                        workflow_id = %job_config.workflow_id,
                        "Cron job registered"
                    );
                }
                Err(e) => {
                    warn!(
                        name = %job_config.name,
                        schedule = %job_config.schedule,
                        error = %e,
                        "Invalid cron expression, skipping job"
                    );
                }
            }
        }

        Self { jobs, engine, cancel }
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// The job that fires first after `now`, with its fire time.
    fn next_due(&self, now: DateTime<Utc>) -> Option<(DateTime<Utc>, usize)> {
        self.jobs
            .iter()
            .enumerate()
            .filter_map(|(i, job)| job.schedule.after(&now).next().map(|at| (at, i)))
            .min_by_key(|(at, _)| *at)
    }

    /// Run until cancelled.
    pub async fn run(&self) {
        if self.jobs.is_empty() {
            info!("No cron jobs configured, trigger idle");
            self.cancel.cancelled().await;
            return;
        }

        info!(count = self.jobs.len(), "Cron trigger started");

        loop {
            let now = Utc::now();
            let Some((fire_at, index)) = self.next_due(now) else {
                self.cancel.cancelled().await;
                break;
            };
            let job = &self.jobs[index];
            let delay = (fire_at - now).to_std().unwrap_or(Duration::from_secs(1));

            info!(
                job = %job.name,
                fire_at = %fire_at.format("%H:%M:%S"),
                delay_secs = delay.as_secs(),
                "Next cron job scheduled"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    info!(job = %job.name, workflow_id = %job.workflow_id, "Firing cron job");
                    match self
                        .engine
                        .submit_workflow(&job.workflow_id, TriggerType::Scheduled, job.input.clone())
                        .await
                    {
                        Ok(execution) => info!(job = %job.name, execution_id = %execution.id, "Cron execution started"),
                        Err(e) => error!(job = %job.name, error = %e, "Cron job failed to start"),
                    }
                }
                _ = self.cancel.cancelled() => {
                    info!("Cron trigger shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use maestro_core::config::{CronJobConfig, EngineConfig};
    use maestro_executors::{ExecutorDeps, ExecutorRegistry};
    use maestro_store::MemoryStore;

    fn trigger(jobs: Vec<CronJobConfig>) -> CronTrigger {
        let store = Arc::new(MemoryStore::new());
        let engine = WorkflowEngine::new(
            EngineConfig::default(),
            store.clone(),
            store,
            ExecutorRegistry::new(ExecutorDeps::default()),
        );
        CronTrigger::new(&CronConfig { jobs }, Arc::new(engine), CancellationToken::new())
    }

    fn job(name: &str, schedule: &str) -> CronJobConfig {
        CronJobConfig {
            name: name.into(),
            schedule: schedule.into(),
            workflow_id: format!("wf-{}", name),
            input: None,
        }
    }

    #[test]
    fn test_invalid_expressions_are_skipped() {
        let t = trigger(vec![job("ok", "0 0 2 * * *"), job("bad", "not a schedule")]);
        assert_eq!(t.job_count(), 1);
    }

    #[test]
    fn test_next_due_picks_earliest_job() {
        let t = trigger(vec![job("nightly", "0 0 2 * * *"), job("hourly", "0 0 * * * *")]);
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 0, 30, 0).unwrap();
        let (at, index) = t.next_due(now).unwrap();
        assert_eq!(t.jobs[index].name, "hourly");
        assert_eq!(at, Utc.with_ymd_and_hms(2026, 3, 1, 1, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let t = trigger(vec![job("nightly", "0 0 2 * * *")]);
        t.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), t.run()).await.unwrap();
    }
}
