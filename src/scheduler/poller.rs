//! The leader's tick loop: read due schedules, dispatch, advance.

use std::sync::Arc;

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::SchedulerConfig;
use crate::db::schedule_repository::ScheduleRepository;
use crate::scheduler::cron::CronCalculator;
use crate::scheduler::dispatcher::{DispatchOutcome, Dispatcher};
use crate::services::backpressure::BackpressureMonitor;
use crate::utils::clock::utc_to_offset;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub dispatched: usize,
    pub skipped: usize,
    pub errors: usize,
    pub paused: bool,
}

pub struct Poller {
    schedules: Arc<dyn ScheduleRepository>,
    dispatcher: Arc<Dispatcher>,
    cron: Arc<CronCalculator>,
    backpressure: Arc<BackpressureMonitor>,
    config: SchedulerConfig,
}

impl Poller {
    pub fn new(
        schedules: Arc<dyn ScheduleRepository>,
        dispatcher: Arc<Dispatcher>,
        cron: Arc<CronCalculator>,
        backpressure: Arc<BackpressureMonitor>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            schedules,
            dispatcher,
            cron,
            backpressure,
            config,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        info!(poll_interval = ?self.config.poll_interval, "schedule poller started");
        let mut ticker = interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("schedule poller stopping");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.tick().await {
                        // Store failure aborts this tick only.
                        error!(error = %err, "schedule poll tick failed");
                    }
                }
            }
        }
    }

    pub async fn tick(&self) -> Result<TickSummary, sqlx::Error> {
        let mut summary = TickSummary::default();
        if self.backpressure.should_pause() {
            summary.paused = true;
            return Ok(summary);
        }

        let due = self.schedules.get_due(self.config.batch_size).await?;
        for schedule in due {
            match self.dispatcher.dispatch(&schedule).await {
                Ok(DispatchOutcome::Dispatched) => {
                    summary.dispatched += 1;
                    match self.cron.next_run_for(
                        schedule.id,
                        &schedule.cron_expression,
                        &schedule.timezone,
                    ) {
                        Ok(next) => {
                            let Some(next_offset) = utc_to_offset(next) else {
                                error!(schedule_id = %schedule.id, "next fire time out of range");
                                continue;
                            };
                            if let Err(err) =
                                self.schedules.record_run(schedule.id, next_offset).await
                            {
                                // At-least-once: the task is enqueued, the
                                // advance retries next tick.
                                warn!(
                                    schedule_id = %schedule.id,
                                    error = %err,
                                    "failed to record schedule run"
                                );
                                summary.errors += 1;
                            }
                        }
                        Err(err) => {
                            error!(
                                schedule_id = %schedule.id,
                                cron = %schedule.cron_expression,
                                error = %err,
                                "cannot compute next fire time"
                            );
                            summary.errors += 1;
                        }
                    }
                }
                Ok(DispatchOutcome::Skipped) => {
                    summary.skipped += 1;
                }
                Err(err) => {
                    warn!(schedule_id = %schedule.id, error = %err, "dispatch failed");
                    summary.errors += 1;
                }
            }
        }
        Ok(summary)
    }
}
