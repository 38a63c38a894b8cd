//! Webhook consumer: drains the buffer stream into the task queue.
//!
//! Each worker runs a consume loop for new messages and a recovery loop
//! that claims messages left pending by a dead or stuck consumer.
//! Recovery failures skip the retry path and go straight to the DLQ;
//! those events already used up their fair processing time.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use tokio::time::{interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::StreamConfig;
use crate::db::workflow_repository::WorkflowRepository;
use crate::models::execution::trigger_type;
use crate::models::webhook_event::WebhookEvent;
use crate::services::task_queue::{EnqueueOptions, TaskQueue, WorkflowExecutionPayload};
use crate::stream::{StreamEntry, WebhookStream};

pub struct WebhookConsumer {
    name: String,
    stream: Arc<dyn WebhookStream>,
    workflows: Arc<dyn WorkflowRepository>,
    queue: Arc<dyn TaskQueue>,
    config: StreamConfig,
}

impl WebhookConsumer {
    pub fn new(
        name: impl Into<String>,
        stream: Arc<dyn WebhookStream>,
        workflows: Arc<dyn WorkflowRepository>,
        queue: Arc<dyn TaskQueue>,
        config: StreamConfig,
    ) -> Self {
        Self {
            name: name.into(),
            stream,
            workflows,
            queue,
            config,
        }
    }

    pub async fn consume_loop(&self, cancel: CancellationToken) {
        info!(consumer = %self.name, "webhook consumer started");
        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => {
                    info!(consumer = %self.name, "webhook consumer stopping");
                    return;
                }
                batch = self.stream.consume(
                    &self.name,
                    self.config.batch_size,
                    self.config.block_timeout,
                ) => batch,
            };

            match batch {
                Ok(entries) => {
                    for entry in entries {
                        self.handle_entry(entry, false).await;
                    }
                }
                Err(err) => {
                    warn!(consumer = %self.name, error = %err, "stream read failed");
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    pub async fn recovery_loop(&self, cancel: CancellationToken) {
        let mut ticker = interval(self.config.claim_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            match self
                .stream
                .claim_stale(&self.name, self.config.stale_timeout, self.config.batch_size)
                .await
            {
                Ok(entries) => {
                    if !entries.is_empty() {
                        info!(
                            consumer = %self.name,
                            claimed = entries.len(),
                            "claimed stale webhook events"
                        );
                    }
                    for entry in entries {
                        self.handle_entry(entry, true).await;
                    }
                }
                Err(err) => {
                    warn!(consumer = %self.name, error = %err, "stale claim failed");
                }
            }
        }
    }

    /// Processes one delivered event. With `straight_to_dlq` the retry
    /// path is skipped and any failure dead-letters the event.
    pub(crate) async fn handle_entry(&self, entry: StreamEntry, straight_to_dlq: bool) {
        let event = &entry.event;

        let endpoint = match self.workflows.find_webhook_endpoint(event.endpoint_id).await {
            Ok(endpoint) => endpoint,
            Err(err) => {
                // Transient; leave pending so a later claim retries it.
                warn!(
                    event_id = %event.event_id,
                    error = %err,
                    "endpoint lookup failed, leaving event pending"
                );
                return;
            }
        };

        let Some(endpoint) = endpoint else {
            debug!(event_id = %event.event_id, endpoint_id = %event.endpoint_id, "unknown endpoint, dropping");
            self.ack_entry(&entry).await;
            return;
        };
        if !endpoint.is_active {
            debug!(event_id = %event.event_id, endpoint_id = %endpoint.id, "inactive endpoint, dropping");
            self.ack_entry(&entry).await;
            return;
        }

        let workflow = match self.workflows.find_workflow_by_id(endpoint.workflow_id).await {
            Ok(workflow) => workflow,
            Err(err) => {
                warn!(
                    event_id = %event.event_id,
                    error = %err,
                    "workflow lookup failed, leaving event pending"
                );
                return;
            }
        };
        let Some(workflow) = workflow.filter(|w| w.is_active) else {
            debug!(
                event_id = %event.event_id,
                workflow_id = %endpoint.workflow_id,
                "missing or inactive workflow, dropping"
            );
            self.ack_entry(&entry).await;
            return;
        };

        let payload = WorkflowExecutionPayload {
            workflow_id: workflow.id,
            workspace_id: endpoint.workspace_id,
            execution_id: None,
            triggered_by: None,
            trigger_type: trigger_type::WEBHOOK.to_string(),
            trigger_data: Some(build_trigger_data(event)),
            input_data: None,
        };
        let message = match payload.into_message() {
            Ok(message) => message,
            Err(err) => {
                self.dead_letter(&entry, &format!("unserializable payload: {err}"))
                    .await;
                return;
            }
        };

        match self
            .queue
            .enqueue(message, EnqueueOptions::default())
            .await
        {
            Ok(()) => self.ack_entry(&entry).await,
            Err(err) => {
                let reason = format!("enqueue failed: {err}");
                if straight_to_dlq || event.retry_count >= self.config.max_retries {
                    self.dead_letter(&entry, &reason).await;
                } else {
                    self.republish(&entry, &reason).await;
                }
            }
        }
    }

    async fn ack_entry(&self, entry: &StreamEntry) {
        if let Err(err) = self.stream.ack(std::slice::from_ref(&entry.id)).await {
            error!(stream_id = %entry.id, error = %err, "ack failed");
        }
    }

    /// Re-publishes under a fresh stream id (resetting the pending
    /// timer) and acks the original. The carried `event_id` stays
    /// stable for downstream dedupe.
    async fn republish(&self, entry: &StreamEntry, reason: &str) {
        let mut event = entry.event.clone();
        event.retry_count += 1;
        warn!(
            event_id = %event.event_id,
            retry_count = event.retry_count,
            %reason,
            "webhook processing failed, re-publishing"
        );
        match self.stream.publish(event).await {
            Ok(_) => self.ack_entry(entry).await,
            Err(err) => {
                // Leave the original pending; the claim path picks it up.
                error!(stream_id = %entry.id, error = %err, "re-publish failed");
            }
        }
    }

    async fn dead_letter(&self, entry: &StreamEntry, reason: &str) {
        error!(
            event_id = %entry.event.event_id,
            retry_count = entry.event.retry_count,
            %reason,
            "webhook event moved to dead letter queue"
        );
        if let Err(err) = self.stream.move_to_dead_letter(entry, reason).await {
            error!(stream_id = %entry.id, error = %err, "dead letter move failed");
        }
    }
}

fn build_trigger_data(event: &WebhookEvent) -> Value {
    let mut data = json!({
        "method": event.method,
        "path": event.path,
        "headers": event.headers,
        "query": event.query,
        "body": event.body,
        "content_type": event.content_type,
        "received_at": event
            .received_at
            .and_then(|t| t.format(&Rfc3339).ok()),
        "event_id": event.event_id,
    });
    if event.is_json() {
        if let Ok(parsed) = serde_json::from_str::<Value>(&event.body) {
            data["json"] = parsed;
        }
    }
    data
}
