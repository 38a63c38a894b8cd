//! Worker process: task queue consumption, webhook stream ingestion,
//! and DAG execution.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

use flowline_backend::config::Config;
use flowline_backend::db::postgres_execution_repository::PostgresExecutionRepository;
use flowline_backend::db::postgres_workflow_repository::PostgresWorkflowRepository;
use flowline_backend::db::workflow_repository::WorkflowRepository;
use flowline_backend::engine::executor::WorkflowExecutor;
use flowline_backend::engine::nodes::builtin_registry;
use flowline_backend::services::cancellation::CancellationManager;
use flowline_backend::services::credentials::EnvCredentialStore;
use flowline_backend::services::events::RedisEventPublisher;
use flowline_backend::services::execution_service::ExecutionService;
use flowline_backend::services::task_queue::{RedisTaskQueue, TaskQueue};
use flowline_backend::stream::redis::RedisWebhookStream;
use flowline_backend::stream::WebhookStream;
use flowline_backend::worker::{spawn_webhook_consumers, WorkerOrchestrator};

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

    let workflows: Arc<dyn WorkflowRepository> = Arc::new(PostgresWorkflowRepository {
        pool: pool.clone(),
    });
    let executions = Arc::new(ExecutionService::new(Arc::new(
        PostgresExecutionRepository { pool },
    )));
    let queue: Arc<dyn TaskQueue> = Arc::new(RedisTaskQueue::new(conn.clone(), "queue"));
    let cancellations = Arc::new(CancellationManager::new());
    let executor = Arc::new(WorkflowExecutor::new(
        workflows.clone(),
        executions,
        Arc::new(builtin_registry()),
        Arc::new(RedisEventPublisher::new(conn.clone())),
        cancellations,
        Arc::new(EnvCredentialStore),
        &config.worker,
    ));

    let orchestrator = Arc::new(WorkerOrchestrator::new(
        queue.clone(),
        executor,
        config.worker.clone(),
    ));

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let mut consumer_handles = Vec::new();
    if config.stream.enabled {
        let stream: Arc<dyn WebhookStream> =
            Arc::new(RedisWebhookStream::new(conn, config.stream.clone()));
        consumer_handles = spawn_webhook_consumers(
            stream,
            workflows,
            queue,
            config.stream.clone(),
            &shutdown,
        );
        info!(
            consumers = config.stream.consumer_count,
            "webhook stream consumers started"
        );
    }

    orchestrator.run(shutdown).await;

    for handle in consumer_handles {
        let _ = handle.await;
    }
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
