//! Scheduler process orchestration.
//!
//! Any number of replicas run this loop; exactly one holds the leader
//! key at a time and runs the Poller, Stale Recovery, and Cleanup
//! workers. Losing the key cancels those workers promptly and drops the
//! replica back to standby; worker state is recreated on the next
//! acquisition, never carried across epochs.

pub mod cron;
pub mod dispatcher;
pub mod poller;
pub mod recovery;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::SchedulerConfig;
use crate::scheduler::poller::Poller;
use crate::scheduler::recovery::{CleanupLoop, StaleRecovery};
use crate::services::backpressure::BackpressureMonitor;
use crate::services::leader::LeaderElection;
use crate::services::task_queue::TaskQueue;

const ACQUIRE_INTERVAL: Duration = Duration::from_secs(5);

struct LeaderEpoch {
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

pub struct SchedulerOrchestrator {
    leader: Arc<dyn LeaderElection>,
    poller: Arc<Poller>,
    recovery: Arc<StaleRecovery>,
    cleanup: Arc<CleanupLoop>,
    backpressure: Arc<BackpressureMonitor>,
    queue: Arc<dyn TaskQueue>,
    config: SchedulerConfig,
}

impl SchedulerOrchestrator {
    pub fn new(
        leader: Arc<dyn LeaderElection>,
        poller: Arc<Poller>,
        recovery: Arc<StaleRecovery>,
        cleanup: Arc<CleanupLoop>,
        backpressure: Arc<BackpressureMonitor>,
        queue: Arc<dyn TaskQueue>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            leader,
            poller,
            recovery,
            cleanup,
            backpressure,
            queue,
            config,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let acquire_every = ACQUIRE_INTERVAL.min(self.config.leader_ttl);
        let extend_every = self.config.leader_ttl / 3;
        let mut acquire_ticker = interval(acquire_every);
        let mut extend_ticker = interval(extend_every.max(Duration::from_millis(10)));
        let mut epoch: Option<LeaderEpoch> = None;

        info!(leader_key = %self.config.leader_key, "scheduler orchestrator started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = acquire_ticker.tick() => {
                    if epoch.is_none() && self.leader.try_acquire().await {
                        epoch = Some(self.start_workers());
                    }
                }
                _ = extend_ticker.tick() => {
                    if epoch.is_some() && !self.leader.extend().await {
                        warn!("leadership lost, stopping leader workers");
                        if let Some(lost) = epoch.take() {
                            self.stop_workers(lost).await;
                        }
                    }
                }
            }
        }

        if let Some(current) = epoch.take() {
            self.stop_workers(current).await;
        }
        self.leader.release().await;
        info!("scheduler orchestrator stopped");
    }

    fn start_workers(&self) -> LeaderEpoch {
        info!("starting leader workers");
        let cancel = CancellationToken::new();
        let mut workers = Vec::new();

        let poller = self.poller.clone();
        let token = cancel.child_token();
        workers.push(tokio::spawn(async move { poller.run(token).await }));

        let recovery = self.recovery.clone();
        let token = cancel.child_token();
        workers.push(tokio::spawn(async move { recovery.run(token).await }));

        let cleanup = self.cleanup.clone();
        let token = cancel.child_token();
        workers.push(tokio::spawn(async move { cleanup.run(token).await }));

        let backpressure = self.backpressure.clone();
        let queue = self.queue.clone();
        let token = cancel.child_token();
        workers.push(tokio::spawn(async move {
            backpressure.run(queue, token).await
        }));

        LeaderEpoch { cancel, workers }
    }

    async fn stop_workers(&self, epoch: LeaderEpoch) {
        epoch.cancel.cancel();
        for worker in epoch.workers {
            if timeout(self.config.shutdown_timeout, worker).await.is_err() {
                warn!("leader worker did not stop in time");
            }
        }
    }
}
