//! Leader-side maintenance: stale schedule recovery and execution
//! retention cleanup.
//!
//! Recovery moves ancient `next_run_at` values forward to the next fire
//! time after now. It never backfills missed runs: automation fires
//! forward, it does not replay.

use std::sync::Arc;

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::SchedulerConfig;
use crate::db::schedule_repository::ScheduleRepository;
use crate::scheduler::cron::CronCalculator;
use crate::services::execution_service::ExecutionService;
use crate::utils::clock::utc_to_offset;

pub struct StaleRecovery {
    schedules: Arc<dyn ScheduleRepository>,
    cron: Arc<CronCalculator>,
    config: SchedulerConfig,
}

impl StaleRecovery {
    pub fn new(
        schedules: Arc<dyn ScheduleRepository>,
        cron: Arc<CronCalculator>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            schedules,
            cron,
            config,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = interval(self.config.stale_check_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep().await {
                        error!(error = %err, "stale schedule sweep failed");
                    }
                }
            }
        }
    }

    /// One pass: every stale schedule gets a fresh future fire time.
    pub async fn sweep(&self) -> Result<usize, sqlx::Error> {
        let stale = self.schedules.get_stale(self.config.stale_threshold).await?;
        let mut recovered = 0;
        for schedule in stale {
            let next = match self
                .cron
                .next_run(&schedule.cron_expression, &schedule.timezone)
            {
                Ok(next) => next,
                Err(err) => {
                    warn!(
                        schedule_id = %schedule.id,
                        cron = %schedule.cron_expression,
                        error = %err,
                        "stale schedule has an unusable expression"
                    );
                    continue;
                }
            };
            let Some(next_offset) = utc_to_offset(next) else {
                warn!(schedule_id = %schedule.id, "next fire time out of range");
                continue;
            };
            match self.schedules.update_next_run(schedule.id, next_offset).await {
                Ok(()) => {
                    info!(
                        schedule_id = %schedule.id,
                        next_run_at = %next,
                        "recovered stale schedule"
                    );
                    recovered += 1;
                }
                Err(err) => {
                    warn!(schedule_id = %schedule.id, error = %err, "stale recovery write failed");
                }
            }
        }
        Ok(recovered)
    }
}

pub struct CleanupLoop {
    executions: Arc<ExecutionService>,
    config: SchedulerConfig,
}

impl CleanupLoop {
    pub fn new(executions: Arc<ExecutionService>, config: SchedulerConfig) -> Self {
        Self { executions, config }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = interval(self.config.cleanup_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    match self
                        .executions
                        .purge_old_executions(self.config.retention_days)
                        .await
                    {
                        Ok(0) => {}
                        Ok(purged) => info!(purged, "purged old executions"),
                        Err(err) => error!(error = %err, "execution cleanup failed"),
                    }
                }
            }
        }
    }
}
