//! Admits due schedules through the rate limiters and enqueues them.
//!
//! A skipped schedule is deliberately not rescheduled: its
//! `next_run_at` stays in the past, so the next poll tick rediscovers
//! it. Rate limits shed load; they never drop work permanently.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use time::format_description::well_known::Rfc3339;
use tracing::debug;

use crate::models::execution::trigger_type;
use crate::models::schedule::{priority, Schedule};
use crate::services::rate_limit::RateLimiter;
use crate::services::task_queue::{
    EnqueueOptions, QueueError, QueueName, TaskQueue, WorkflowExecutionPayload,
};

/// Low-priority schedules are deferred a little to keep them out of the
/// way of interactive work.
const LOW_PRIORITY_DELAY: Duration = Duration::from_secs(10);

pub const GLOBAL_LIMIT_KEY: &str = "global";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Dispatched,
    /// Rate limited; the poller will retry on a later tick.
    Skipped,
}

pub struct Dispatcher {
    queue: Arc<dyn TaskQueue>,
    global_limiter: Arc<dyn RateLimiter>,
    workspace_limiter: Arc<dyn RateLimiter>,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        global_limiter: Arc<dyn RateLimiter>,
        workspace_limiter: Arc<dyn RateLimiter>,
    ) -> Self {
        Self {
            queue,
            global_limiter,
            workspace_limiter,
        }
    }

    pub async fn dispatch(&self, schedule: &Schedule) -> Result<DispatchOutcome, QueueError> {
        if !self.global_limiter.allow(GLOBAL_LIMIT_KEY).await {
            debug!(schedule_id = %schedule.id, "global rate limit reached, skipping");
            return Ok(DispatchOutcome::Skipped);
        }
        let workspace_key = format!("workspace:{}", schedule.workspace_id);
        if !self.workspace_limiter.allow(&workspace_key).await {
            debug!(
                schedule_id = %schedule.id,
                workspace_id = %schedule.workspace_id,
                "workspace rate limit reached, skipping"
            );
            return Ok(DispatchOutcome::Skipped);
        }

        let scheduled_at = schedule
            .next_run_at
            .and_then(|t| t.format(&Rfc3339).ok());
        let payload = WorkflowExecutionPayload {
            workflow_id: schedule.workflow_id,
            workspace_id: schedule.workspace_id,
            execution_id: None,
            triggered_by: None,
            trigger_type: trigger_type::SCHEDULE.to_string(),
            trigger_data: Some(json!({
                "schedule_id": schedule.id,
                "schedule_name": schedule.name,
                "scheduled_at": scheduled_at,
            })),
            input_data: match &schedule.input_data {
                serde_json::Value::Null => None,
                other => Some(other.clone()),
            },
        };
        let message = payload.into_message()?;

        let (queue_name, process_in) = match schedule.priority.as_str() {
            priority::HIGH => (QueueName::Critical, None),
            priority::LOW => (QueueName::Low, Some(LOW_PRIORITY_DELAY)),
            _ => (QueueName::Default, None),
        };
        self.queue
            .enqueue(
                message,
                EnqueueOptions {
                    queue: queue_name,
                    process_in,
                    ..Default::default()
                },
            )
            .await?;
        Ok(DispatchOutcome::Dispatched)
    }
}
