//! Scheduler process: leader-elected cron dispatch.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

use flowline_backend::config::Config;
use flowline_backend::db::postgres_execution_repository::PostgresExecutionRepository;
use flowline_backend::db::postgres_schedule_repository::PostgresScheduleRepository;
use flowline_backend::db::schedule_repository::ScheduleRepository;
use flowline_backend::scheduler::cron::CronCalculator;
use flowline_backend::scheduler::dispatcher::Dispatcher;
use flowline_backend::scheduler::poller::Poller;
use flowline_backend::scheduler::recovery::{CleanupLoop, StaleRecovery};
use flowline_backend::scheduler::SchedulerOrchestrator;
use flowline_backend::services::backpressure::BackpressureMonitor;
use flowline_backend::services::execution_service::ExecutionService;
use flowline_backend::services::leader::{LeaderElection, RedisLeaderElection};
use flowline_backend::services::rate_limit::{RateLimiter, RedisSlidingWindowLimiter};
use flowline_backend::services::task_queue::{RedisTaskQueue, TaskQueue};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to postgres")?;
    let redis_client =
        redis::Client::open(config.redis_url.clone()).context("invalid redis url")?;
    let conn = redis::aio::ConnectionManager::new(redis_client)
        .await
        .context("failed to connect to redis")?;

    let schedules: Arc<dyn ScheduleRepository> = Arc::new(PostgresScheduleRepository {
        pool: pool.clone(),
    });
    let queue: Arc<dyn TaskQueue> = Arc::new(RedisTaskQueue::new(conn.clone(), "queue"));
    let global_limiter: Arc<dyn RateLimiter> = Arc::new(RedisSlidingWindowLimiter::new(
        conn.clone(),
        "ratelimit:dispatch",
        config.scheduler.global_rate_limit,
        config.scheduler.rate_limit_window,
    ));
    let workspace_limiter: Arc<dyn RateLimiter> = Arc::new(RedisSlidingWindowLimiter::new(
        conn.clone(),
        "ratelimit:dispatch",
        config.scheduler.workspace_rate_limit,
        config.scheduler.rate_limit_window,
    ));

    let dispatcher = Arc::new(Dispatcher::new(
        queue.clone(),
        global_limiter,
        workspace_limiter,
    ));
    let cron = Arc::new(CronCalculator::new());
    let backpressure = Arc::new(BackpressureMonitor::new(config.scheduler.max_queue_depth));
    let poller = Arc::new(Poller::new(
        schedules.clone(),
        dispatcher,
        cron.clone(),
        backpressure.clone(),
        config.scheduler.clone(),
    ));
    let recovery = Arc::new(StaleRecovery::new(
        schedules,
        cron,
        config.scheduler.clone(),
    ));
    let executions = Arc::new(ExecutionService::new(Arc::new(
        PostgresExecutionRepository { pool },
    )));
    let cleanup = Arc::new(CleanupLoop::new(executions, config.scheduler.clone()));
    let leader: Arc<dyn LeaderElection> = Arc::new(RedisLeaderElection::new(
        conn,
        config.scheduler.leader_key.clone(),
        config.scheduler.leader_ttl,
    ));

    let orchestrator = SchedulerOrchestrator::new(
        leader,
        poller,
        recovery,
        cleanup,
        backpressure,
        queue,
        config.scheduler.clone(),
    );

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    orchestrator.run(shutdown).await;
    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut terminate =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = terminate.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        info!("shutdown signal received");
        shutdown.cancel();
    });
}
