//! At-least-once task queue with priorities, delay, and retries.
//!
//! The Redis implementation keeps one list per priority queue, a scored
//! set of delayed tasks, and a processing list per priority that holds
//! in-flight payloads until they are acked or retried.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub mod task_type {
    pub const WORKFLOW_EXECUTION: &str = "workflow:execution";
    pub const NOTIFICATION_SEND: &str = "notification:send";
    pub const WEBHOOK_DELIVERY: &str = "webhook:delivery";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueName {
    Critical,
    Default,
    Low,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Default => "default",
            Self::Low => "low",
        }
    }

    pub fn all() -> [QueueName; 3] {
        [Self::Critical, Self::Default, Self::Low]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task_type: String,
    pub payload: Value,
}

/// Payload of a `workflow:execution` task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecutionPayload {
    pub workflow_id: Uuid,
    pub workspace_id: Uuid,
    #[serde(default)]
    pub execution_id: Option<Uuid>,
    #[serde(default)]
    pub triggered_by: Option<Uuid>,
    pub trigger_type: String,
    #[serde(default)]
    pub trigger_data: Option<Value>,
    #[serde(default)]
    pub input_data: Option<Value>,
}

impl WorkflowExecutionPayload {
    pub fn into_message(self) -> Result<TaskMessage, serde_json::Error> {
        Ok(TaskMessage {
            task_type: task_type::WORKFLOW_EXECUTION.to_string(),
            payload: serde_json::to_value(self)?,
        })
    }
}

/// Payload of a `notification:send` task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPayload {
    #[serde(rename = "type")]
    pub notification_type: String,
    pub recipient: String,
    #[serde(default)]
    pub subject: Option<String>,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// Payload of a `webhook:delivery` task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDeliveryPayload {
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: Option<std::collections::HashMap<String, String>>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub secret: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub queue: QueueName,
    pub process_in: Option<Duration>,
    pub max_retry: u32,
    pub timeout: Duration,
    pub retention: Duration,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            queue: QueueName::Default,
            process_in: None,
            max_retry: 3,
            timeout: Duration::from_secs(300),
            retention: Duration::from_secs(24 * 3600),
        }
    }
}

/// A task as handed to a worker; carried back on ack/retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedTask {
    pub id: Uuid,
    pub task: TaskMessage,
    pub queue: QueueName,
    pub retried: u32,
    pub max_retry: u32,
}

impl QueuedTask {
    pub fn retries_exhausted(&self) -> bool {
        self.retried >= self.max_retry
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(String),
    #[error("task serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        Self::Backend(err.to_string())
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: TaskMessage, opts: EnqueueOptions) -> Result<(), QueueError>;

    /// Pops one due task, honoring per-queue weights across calls.
    async fn dequeue(&self, weights: &[(QueueName, u32)]) -> Result<Option<QueuedTask>, QueueError>;

    async fn ack(&self, task: &QueuedTask) -> Result<(), QueueError>;

    /// Returns the task to the delayed set with its retry count bumped.
    async fn retry(&self, task: &QueuedTask, delay: Duration, error: &str)
        -> Result<(), QueueError>;

    /// Ready + delayed backlog, observed by the backpressure monitor.
    async fn depth(&self) -> Result<u64, QueueError>;
}

pub struct RedisTaskQueue {
    conn: ConnectionManager,
    prefix: String,
    rotation: AtomicU64,
}

impl RedisTaskQueue {
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            rotation: AtomicU64::new(0),
        }
    }

    fn queue_key(&self, queue: QueueName) -> String {
        format!("{}:{}", self.prefix, queue.as_str())
    }

    fn processing_key(&self, queue: QueueName) -> String {
        format!("{}:{}:processing", self.prefix, queue.as_str())
    }

    fn delayed_key(&self) -> String {
        format!("{}:delayed", self.prefix)
    }

    /// Moves delayed tasks whose ready time has passed onto their queue.
    async fn promote_due(&self, conn: &mut ConnectionManager) -> Result<(), QueueError> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.delayed_key())
            .arg("-inf")
            .arg(now_ms)
            .arg("LIMIT")
            .arg(0)
            .arg(100)
            .query_async(conn)
            .await?;

        for raw in due {
            let removed: i64 = redis::cmd("ZREM")
                .arg(self.delayed_key())
                .arg(&raw)
                .query_async(conn)
                .await?;
            if removed == 0 {
                // Another worker promoted it first.
                continue;
            }
            match serde_json::from_str::<QueuedTask>(&raw) {
                Ok(task) => {
                    let _: i64 = redis::cmd("LPUSH")
                        .arg(self.queue_key(task.queue))
                        .arg(&raw)
                        .query_async(conn)
                        .await?;
                }
                Err(err) => {
                    warn!(error = %err, "dropping undecodable delayed task");
                }
            }
        }
        Ok(())
    }

    fn weighted_order(&self, weights: &[(QueueName, u32)]) -> Vec<QueueName> {
        let total: u64 = weights.iter().map(|(_, w)| *w as u64).sum();
        if total == 0 {
            return weights.iter().map(|(q, _)| *q).collect();
        }
        let slot = self.rotation.fetch_add(1, Ordering::Relaxed) % total;
        let mut cumulative = 0u64;
        let mut first = weights[0].0;
        for (queue, weight) in weights {
            cumulative += *weight as u64;
            if slot < cumulative {
                first = *queue;
                break;
            }
        }
        let mut order = vec![first];
        for (queue, _) in weights {
            if *queue != first {
                order.push(*queue);
            }
        }
        order
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn enqueue(&self, task: TaskMessage, opts: EnqueueOptions) -> Result<(), QueueError> {
        let queued = QueuedTask {
            id: Uuid::new_v4(),
            task,
            queue: opts.queue,
            retried: 0,
            max_retry: opts.max_retry,
        };
        let raw = serde_json::to_string(&queued)?;
        let mut conn = self.conn.clone();

        match opts.process_in {
            Some(delay) if !delay.is_zero() => {
                let ready_at = chrono::Utc::now().timestamp_millis() + delay.as_millis() as i64;
                let _: i64 = redis::cmd("ZADD")
                    .arg(self.delayed_key())
                    .arg(ready_at)
                    .arg(raw)
                    .query_async(&mut conn)
                    .await?;
            }
            _ => {
                let _: i64 = redis::cmd("LPUSH")
                    .arg(self.queue_key(opts.queue))
                    .arg(raw)
                    .query_async(&mut conn)
                    .await?;
            }
        }
        Ok(())
    }

    async fn dequeue(
        &self,
        weights: &[(QueueName, u32)],
    ) -> Result<Option<QueuedTask>, QueueError> {
        if weights.is_empty() {
            return Ok(None);
        }
        let mut conn = self.conn.clone();
        self.promote_due(&mut conn).await?;

        for queue in self.weighted_order(weights) {
            let raw: Option<String> = redis::cmd("RPOPLPUSH")
                .arg(self.queue_key(queue))
                .arg(self.processing_key(queue))
                .query_async(&mut conn)
                .await?;
            if let Some(raw) = raw {
                match serde_json::from_str::<QueuedTask>(&raw) {
                    Ok(task) => return Ok(Some(task)),
                    Err(err) => {
                        warn!(error = %err, "dropping undecodable queued task");
                        let _: i64 = redis::cmd("LREM")
                            .arg(self.processing_key(queue))
                            .arg(1)
                            .arg(&raw)
                            .query_async(&mut conn)
                            .await?;
                    }
                }
            }
        }
        Ok(None)
    }

    async fn ack(&self, task: &QueuedTask) -> Result<(), QueueError> {
        let raw = serde_json::to_string(task)?;
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("LREM")
            .arg(self.processing_key(task.queue))
            .arg(1)
            .arg(raw)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn retry(
        &self,
        task: &QueuedTask,
        delay: Duration,
        error: &str,
    ) -> Result<(), QueueError> {
        let original = serde_json::to_string(task)?;
        let mut bumped = task.clone();
        bumped.retried += 1;
        let raw = serde_json::to_string(&bumped)?;
        warn!(
            task_id = %task.id,
            task_type = %task.task.task_type,
            retried = bumped.retried,
            %error,
            "task failed, scheduling retry"
        );

        let ready_at = chrono::Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let mut conn = self.conn.clone();
        let write: Result<(), redis::RedisError> = redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(self.processing_key(task.queue))
            .arg(1)
            .arg(original)
            .cmd("ZADD")
            .arg(self.delayed_key())
            .arg(ready_at)
            .arg(raw)
            .query_async(&mut conn)
            .await;
        write?;
        Ok(())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let mut total: u64 = 0;
        for queue in QueueName::all() {
            let len: u64 = redis::cmd("LLEN")
                .arg(self.queue_key(queue))
                .query_async(&mut conn)
                .await?;
            total += len;
        }
        let delayed: u64 = redis::cmd("ZCARD")
            .arg(self.delayed_key())
            .query_async(&mut conn)
            .await?;
        Ok(total + delayed)
    }
}

#[derive(Default)]
struct MemoryQueueState {
    queues: HashMap<QueueName, VecDeque<QueuedTask>>,
    delayed: Vec<(Instant, QueuedTask)>,
    processing: Vec<QueuedTask>,
}

/// Process-local queue used by tests and the single-binary dev setup.
#[derive(Default)]
pub struct MemoryTaskQueue {
    state: Mutex<MemoryQueueState>,
    rotation: AtomicU64,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of ready tasks, for assertions.
    pub fn ready_tasks(&self) -> Vec<QueuedTask> {
        let state = self.state.lock().unwrap();
        QueueName::all()
            .iter()
            .flat_map(|q| state.queues.get(q).cloned().unwrap_or_default())
            .collect()
    }

    fn promote_due(state: &mut MemoryQueueState) {
        let now = Instant::now();
        let mut remaining = Vec::new();
        for (ready_at, task) in state.delayed.drain(..) {
            if ready_at <= now {
                state.queues.entry(task.queue).or_default().push_back(task);
            } else {
                remaining.push((ready_at, task));
            }
        }
        state.delayed = remaining;
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue(&self, task: TaskMessage, opts: EnqueueOptions) -> Result<(), QueueError> {
        let queued = QueuedTask {
            id: Uuid::new_v4(),
            task,
            queue: opts.queue,
            retried: 0,
            max_retry: opts.max_retry,
        };
        let mut state = self.state.lock().unwrap();
        match opts.process_in {
            Some(delay) if !delay.is_zero() => {
                state.delayed.push((Instant::now() + delay, queued));
            }
            _ => {
                state
                    .queues
                    .entry(opts.queue)
                    .or_default()
                    .push_back(queued);
            }
        }
        Ok(())
    }

    async fn dequeue(
        &self,
        weights: &[(QueueName, u32)],
    ) -> Result<Option<QueuedTask>, QueueError> {
        if weights.is_empty() {
            return Ok(None);
        }
        let mut state = self.state.lock().unwrap();
        Self::promote_due(&mut state);

        let total: u64 = weights.iter().map(|(_, w)| *w as u64).sum();
        let slot = if total == 0 {
            0
        } else {
            self.rotation.fetch_add(1, Ordering::Relaxed) % total
        };
        let mut cumulative = 0u64;
        let mut first = weights[0].0;
        for (queue, weight) in weights {
            cumulative += *weight as u64;
            if slot < cumulative {
                first = *queue;
                break;
            }
        }
        let mut order = vec![first];
        for (queue, _) in weights {
            if *queue != first {
                order.push(*queue);
            }
        }

        for queue in order {
            if let Some(task) = state.queues.entry(queue).or_default().pop_front() {
                state.processing.push(task.clone());
                return Ok(Some(task));
            }
        }
        Ok(None)
    }

    async fn ack(&self, task: &QueuedTask) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        state.processing.retain(|t| t.id != task.id);
        Ok(())
    }

    async fn retry(
        &self,
        task: &QueuedTask,
        delay: Duration,
        _error: &str,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        state.processing.retain(|t| t.id != task.id);
        let mut bumped = task.clone();
        bumped.retried += 1;
        state.delayed.push((Instant::now() + delay, bumped));
        Ok(())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let state = self.state.lock().unwrap();
        let ready: usize = state.queues.values().map(|q| q.len()).sum();
        Ok((ready + state.delayed.len()) as u64)
    }
}
