//! Fire-and-forget progress event publishing.

use std::sync::Mutex;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::warn;

use crate::models::event::EventEnvelope;

#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Best-effort delivery; failures are logged and swallowed so an
    /// event outage never fails an execution.
    async fn publish(&self, envelope: EventEnvelope);
}

pub struct RedisEventPublisher {
    conn: ConnectionManager,
}

impl RedisEventPublisher {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl EventPublisher for RedisEventPublisher {
    async fn publish(&self, envelope: EventEnvelope) {
        let channel = envelope.channel();
        let payload = envelope.to_json().to_string();
        let mut conn = self.conn.clone();
        let outcome: Result<i64, redis::RedisError> = redis::cmd("PUBLISH")
            .arg(&channel)
            .arg(payload)
            .query_async(&mut conn)
            .await;
        if let Err(err) = outcome {
            warn!(%channel, error = %err, "event publish failed");
        }
    }
}

/// Captures envelopes in memory; used by tests.
#[derive(Default)]
pub struct MemoryEventPublisher {
    events: Mutex<Vec<EventEnvelope>>,
}

impl MemoryEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EventEnvelope> {
        self.events.lock().unwrap().clone()
    }

    pub fn event_types(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.event.event_type())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for MemoryEventPublisher {
    async fn publish(&self, envelope: EventEnvelope) {
        self.events.lock().unwrap().push(envelope);
    }
}
