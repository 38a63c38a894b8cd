//! Worker process orchestration: drains the task queue with bounded
//! concurrency and multiplexes the registered task types.
//!
//! Payloads that fail to parse are acked and never retried; transient
//! failures go back to the queue with exponential backoff until the
//! task's retry budget runs out.

use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use reqwest::Method;
use sha2::Sha256;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{StreamConfig, WorkerConfig};
use crate::db::workflow_repository::WorkflowRepository;
use crate::engine::executor::WorkflowExecutor;
use crate::services::task_queue::{
    task_type, NotificationPayload, QueueName, QueuedTask, TaskQueue, WebhookDeliveryPayload,
    WorkflowExecutionPayload,
};
use crate::stream::consumer::WebhookConsumer;
use crate::stream::WebhookStream;

const SIGNATURE_HEADER: &str = "X-Signature-256";

pub struct WorkerOrchestrator {
    queue: Arc<dyn TaskQueue>,
    executor: Arc<WorkflowExecutor>,
    http: reqwest::Client,
    config: WorkerConfig,
}

impl WorkerOrchestrator {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        executor: Arc<WorkflowExecutor>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            executor,
            http: reqwest::Client::new(),
            config,
        }
    }

    fn weights(&self) -> [(QueueName, u32); 3] {
        [
            (QueueName::Critical, self.config.critical_weight),
            (QueueName::Default, self.config.default_weight),
            (QueueName::Low, self.config.low_weight),
        ]
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(concurrency = self.config.concurrency, "worker started");
        let weights = self.weights();
        let mut inflight: JoinSet<()> = JoinSet::new();

        loop {
            while let Some(finished) = inflight.try_join_next() {
                if let Err(err) = finished {
                    warn!(error = ?err, "worker task panicked");
                }
            }
            if cancel.is_cancelled() {
                break;
            }
            if inflight.len() >= self.config.concurrency {
                sleep(Duration::from_millis(50)).await;
                continue;
            }

            match self.queue.dequeue(&weights).await {
                Ok(Some(task)) => {
                    let this = self.clone();
                    inflight.spawn(async move { this.handle_task(task).await });
                }
                Ok(None) => {
                    let idle = if inflight.is_empty() {
                        Duration::from_millis(250)
                    } else {
                        Duration::from_millis(100)
                    };
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(idle) => {}
                    }
                }
                Err(err) => {
                    warn!(error = %err, "dequeue failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }

        info!("worker draining in-flight tasks");
        let drained = timeout(self.config.shutdown_timeout, async {
            while inflight.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("shutdown timeout reached, aborting remaining tasks");
            inflight.abort_all();
        }
        info!("worker stopped");
    }

    async fn handle_task(&self, task: QueuedTask) {
        match task.task.task_type.as_str() {
            task_type::WORKFLOW_EXECUTION => self.handle_workflow_execution(&task).await,
            task_type::NOTIFICATION_SEND => self.handle_notification(&task).await,
            task_type::WEBHOOK_DELIVERY => self.handle_webhook_delivery(&task).await,
            other => {
                error!(task_id = %task.id, task_type = %other, "unknown task type, dropping");
                self.ack(&task).await;
            }
        }
    }

    async fn handle_workflow_execution(&self, task: &QueuedTask) {
        let payload: WorkflowExecutionPayload =
            match serde_json::from_value(task.task.payload.clone()) {
                Ok(payload) => payload,
                Err(err) => {
                    error!(task_id = %task.id, error = %err, "invalid execution payload, dropping");
                    self.ack(task).await;
                    return;
                }
            };

        match self.executor.execute(payload).await {
            Ok(()) => self.ack(task).await,
            Err(err) => {
                self.retry_or_drop(task, &format!("execution persistence failed: {err}"))
                    .await;
            }
        }
    }

    async fn handle_notification(&self, task: &QueuedTask) {
        let payload: NotificationPayload = match serde_json::from_value(task.task.payload.clone())
        {
            Ok(payload) => payload,
            Err(err) => {
                error!(task_id = %task.id, error = %err, "invalid notification payload, dropping");
                self.ack(task).await;
                return;
            }
        };
        if payload.notification_type.trim().is_empty() || payload.recipient.trim().is_empty() {
            error!(task_id = %task.id, "notification missing type or recipient, dropping");
            self.ack(task).await;
            return;
        }

        // The mailer lives outside this crate; the worker's sink is a
        // structured log the delivery service tails.
        info!(
            notification_type = %payload.notification_type,
            recipient = %payload.recipient,
            subject = payload.subject.as_deref().unwrap_or_default(),
            message = %payload.message,
            "notification dispatched"
        );
        self.ack(task).await;
    }

    async fn handle_webhook_delivery(&self, task: &QueuedTask) {
        let payload: WebhookDeliveryPayload =
            match serde_json::from_value(task.task.payload.clone()) {
                Ok(payload) => payload,
                Err(err) => {
                    error!(task_id = %task.id, error = %err, "invalid delivery payload, dropping");
                    self.ack(task).await;
                    return;
                }
            };

        let method = match Method::from_bytes(payload.method.to_uppercase().as_bytes()) {
            Ok(method) => method,
            Err(_) => {
                error!(task_id = %task.id, method = %payload.method, "invalid delivery method, dropping");
                self.ack(task).await;
                return;
            }
        };

        let body = payload
            .body
            .as_ref()
            .map(|b| serde_json::to_vec(b).unwrap_or_default())
            .unwrap_or_default();

        let mut request = self
            .http
            .request(method, &payload.url)
            .timeout(Duration::from_secs(30))
            .header("content-type", "application/json")
            .body(body.clone());
        if let Some(headers) = &payload.headers {
            for (name, value) in headers {
                request = request.header(name, value);
            }
        }
        if let Some(secret) = payload.secret.as_deref().filter(|s| !s.is_empty()) {
            request = request.header(SIGNATURE_HEADER, sign_payload(secret, &body));
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => self.ack(task).await,
            Ok(response) if response.status().is_server_error() => {
                self.retry_or_drop(
                    task,
                    &format!("delivery returned {}", response.status()),
                )
                .await;
            }
            Ok(response) => {
                // 4xx will not get better with retries.
                error!(
                    task_id = %task.id,
                    url = %payload.url,
                    status = %response.status(),
                    "delivery rejected, dropping"
                );
                self.ack(task).await;
            }
            Err(err) => {
                self.retry_or_drop(task, &format!("delivery failed: {err}"))
                    .await;
            }
        }
    }

    async fn retry_or_drop(&self, task: &QueuedTask, reason: &str) {
        if task.retries_exhausted() {
            error!(
                task_id = %task.id,
                task_type = %task.task.task_type,
                retried = task.retried,
                %reason,
                "retries exhausted, dropping task"
            );
            self.ack(task).await;
            return;
        }
        let delay = retry_backoff(task.retried);
        if let Err(err) = self.queue.retry(task, delay, reason).await {
            error!(task_id = %task.id, error = %err, "retry scheduling failed");
        }
    }

    async fn ack(&self, task: &QueuedTask) {
        if let Err(err) = self.queue.ack(task).await {
            error!(task_id = %task.id, error = %err, "ack failed");
        }
    }
}

/// 1s, 2s, 4s, ... capped at a minute.
fn retry_backoff(retried: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(retried).min(60))
}

fn sign_payload(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Starts the configured number of in-process webhook stream consumers,
/// each with its consume and recovery loops.
pub fn spawn_webhook_consumers(
    stream: Arc<dyn WebhookStream>,
    workflows: Arc<dyn WorkflowRepository>,
    queue: Arc<dyn TaskQueue>,
    config: StreamConfig,
    cancel: &CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();
    for index in 0..config.consumer_count {
        let consumer = Arc::new(WebhookConsumer::new(
            format!("worker-consumer-{index}"),
            stream.clone(),
            workflows.clone(),
            queue.clone(),
            config.clone(),
        ));
        let consume = consumer.clone();
        let token = cancel.child_token();
        handles.push(tokio::spawn(async move { consume.consume_loop(token).await }));
        let token = cancel.child_token();
        handles.push(tokio::spawn(
            async move { consumer.recovery_loop(token).await },
        ));
    }
    handles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::mock_db::{MemoryExecutionRepository, MemoryWorkflowRepository};
    use crate::engine::registry::NodeRegistry;
    use crate::models::execution::{status, trigger_type};
    use crate::models::workflow::Workflow;
    use crate::services::cancellation::CancellationManager;
    use crate::services::credentials::StaticCredentialStore;
    use crate::services::events::MemoryEventPublisher;
    use crate::services::execution_service::ExecutionService;
    use crate::services::task_queue::{EnqueueOptions, MemoryTaskQueue, TaskMessage};
    use httpmock::prelude::*;
    use serde_json::json;
    use time::OffsetDateTime;
    use uuid::Uuid;

    struct Rig {
        orchestrator: Arc<WorkerOrchestrator>,
        queue: Arc<MemoryTaskQueue>,
        executions: Arc<MemoryExecutionRepository>,
        workflow_id: Uuid,
        workspace_id: Uuid,
    }

    fn rig() -> Rig {
        let workflows = Arc::new(MemoryWorkflowRepository::default());
        let workflow_id = Uuid::new_v4();
        let workspace_id = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();
        workflows.insert_workflow(Workflow {
            id: workflow_id,
            workspace_id,
            name: "noop flow".into(),
            is_active: true,
            definition: json!({
                "nodes": [{"id": "a", "type": "noop"}],
                "connections": [],
            }),
            created_at: now,
            updated_at: now,
        });

        let executions = Arc::new(MemoryExecutionRepository::default());
        let service = Arc::new(ExecutionService::new(executions.clone()));
        let mut registry = NodeRegistry::new();
        registry.register("noop", Arc::new(crate::engine::nodes::NoopNode));
        let executor = Arc::new(WorkflowExecutor::new(
            workflows,
            service,
            Arc::new(registry),
            Arc::new(MemoryEventPublisher::new()),
            Arc::new(CancellationManager::new()),
            Arc::new(StaticCredentialStore::new()),
            &WorkerConfig::default(),
        ));

        let queue = Arc::new(MemoryTaskQueue::new());
        let orchestrator = Arc::new(WorkerOrchestrator::new(
            queue.clone(),
            executor,
            WorkerConfig::default(),
        ));
        Rig {
            orchestrator,
            queue,
            executions,
            workflow_id,
            workspace_id,
        }
    }

    async fn dequeue(rig: &Rig) -> QueuedTask {
        rig.queue
            .dequeue(&rig.orchestrator.weights())
            .await
            .unwrap()
            .expect("task available")
    }

    #[tokio::test]
    async fn workflow_task_executes_and_acks() {
        let r = rig();
        let payload = WorkflowExecutionPayload {
            workflow_id: r.workflow_id,
            workspace_id: r.workspace_id,
            execution_id: None,
            triggered_by: None,
            trigger_type: trigger_type::MANUAL.to_string(),
            trigger_data: None,
            input_data: None,
        };
        r.queue
            .enqueue(payload.into_message().unwrap(), EnqueueOptions::default())
            .await
            .unwrap();

        let task = dequeue(&r).await;
        r.orchestrator.handle_task(task).await;

        let executions = r.executions.executions();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, status::COMPLETED);
        assert_eq!(r.queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn invalid_payload_is_dropped_not_retried() {
        let r = rig();
        r.queue
            .enqueue(
                TaskMessage {
                    task_type: task_type::WORKFLOW_EXECUTION.to_string(),
                    payload: json!("garbage"),
                },
                EnqueueOptions::default(),
            )
            .await
            .unwrap();

        let task = dequeue(&r).await;
        r.orchestrator.handle_task(task).await;

        assert!(r.executions.executions().is_empty());
        assert_eq!(r.queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_task_type_is_dropped() {
        let r = rig();
        r.queue
            .enqueue(
                TaskMessage {
                    task_type: "mystery:task".to_string(),
                    payload: json!({}),
                },
                EnqueueOptions::default(),
            )
            .await
            .unwrap();

        let task = dequeue(&r).await;
        r.orchestrator.handle_task(task).await;
        assert_eq!(r.queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn notification_task_is_logged_and_acked() {
        let r = rig();
        r.queue
            .enqueue(
                TaskMessage {
                    task_type: task_type::NOTIFICATION_SEND.to_string(),
                    payload: json!({
                        "type": "email",
                        "recipient": "ops@example.com",
                        "message": "nightly export finished",
                    }),
                },
                EnqueueOptions::default(),
            )
            .await
            .unwrap();

        let task = dequeue(&r).await;
        r.orchestrator.handle_task(task).await;
        assert_eq!(r.queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn webhook_delivery_signs_the_body() {
        let r = rig();
        let body = json!({"event": "done"});
        let expected = sign_payload("s3cret", &serde_json::to_vec(&body).unwrap());

        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(move |when, then| {
                when.method(POST)
                    .path("/sink")
                    .header(SIGNATURE_HEADER.to_lowercase(), expected.clone());
                then.status(200);
            })
            .await;

        r.queue
            .enqueue(
                TaskMessage {
                    task_type: task_type::WEBHOOK_DELIVERY.to_string(),
                    payload: json!({
                        "url": server.url("/sink"),
                        "method": "POST",
                        "body": body,
                        "secret": "s3cret",
                    }),
                },
                EnqueueOptions::default(),
            )
            .await
            .unwrap();

        let task = dequeue(&r).await;
        r.orchestrator.handle_task(task).await;

        mock.assert_async().await;
        assert_eq!(r.queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn server_error_schedules_a_retry() {
        let r = rig();
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/sink");
                then.status(503);
            })
            .await;

        r.queue
            .enqueue(
                TaskMessage {
                    task_type: task_type::WEBHOOK_DELIVERY.to_string(),
                    payload: json!({
                        "url": server.url("/sink"),
                        "method": "POST",
                        "body": {"x": 1},
                    }),
                },
                EnqueueOptions::default(),
            )
            .await
            .unwrap();

        let task = dequeue(&r).await;
        r.orchestrator.handle_task(task).await;

        // Back on the queue as a delayed retry.
        assert_eq!(r.queue.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn client_error_is_dropped() {
        let r = rig();
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/sink");
                then.status(404);
            })
            .await;

        r.queue
            .enqueue(
                TaskMessage {
                    task_type: task_type::WEBHOOK_DELIVERY.to_string(),
                    payload: json!({
                        "url": server.url("/sink"),
                        "method": "POST",
                    }),
                },
                EnqueueOptions::default(),
            )
            .await
            .unwrap();

        let task = dequeue(&r).await;
        r.orchestrator.handle_task(task).await;
        assert_eq!(r.queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn run_loop_drains_queued_tasks() {
        let r = rig();
        for _ in 0..2 {
            let payload = WorkflowExecutionPayload {
                workflow_id: r.workflow_id,
                workspace_id: r.workspace_id,
                execution_id: None,
                triggered_by: None,
                trigger_type: trigger_type::MANUAL.to_string(),
                trigger_data: None,
                input_data: None,
            };
            r.queue
                .enqueue(payload.into_message().unwrap(), EnqueueOptions::default())
                .await
                .unwrap();
        }

        let cancel = CancellationToken::new();
        let worker = r.orchestrator.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { worker.run(token).await });

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let done = r
                    .executions
                    .executions()
                    .iter()
                    .filter(|e| e.status == status::COMPLETED)
                    .count();
                if done == 2 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("both executions complete");

        cancel.cancel();
        let _ = handle.await;
        assert_eq!(r.queue.depth().await.unwrap(), 0);
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(retry_backoff(0), Duration::from_secs(1));
        assert_eq!(retry_backoff(1), Duration::from_secs(2));
        assert_eq!(retry_backoff(3), Duration::from_secs(8));
        assert_eq!(retry_backoff(10), Duration::from_secs(60));
    }
}
