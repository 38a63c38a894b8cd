//! Append-only webhook buffer between HTTP receivers and dispatch.
//!
//! Messages stay pending from delivery until they are acked, moved to
//! the dead-letter stream, or claimed by another consumer after going
//! stale. An event is only ever lost from the main stream through ack,
//! DLQ move, or capped-length trim of already-acked history.

pub mod consumer;
pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::models::webhook_event::WebhookEvent;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream backend error: {0}")]
    Backend(String),
    #[error("event serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<::redis::RedisError> for StreamError {
    fn from(err: ::redis::RedisError) -> Self {
        Self::Backend(err.to_string())
    }
}

/// A delivered message: the stream id that must be acked plus the event.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub event: WebhookEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub event: WebhookEvent,
    pub original_id: String,
    pub reason: String,
    #[serde(with = "time::serde::rfc3339")]
    pub moved_at: OffsetDateTime,
}

/// Stamps publisher-owned fields before append.
pub(crate) fn prepare_event(mut event: WebhookEvent) -> WebhookEvent {
    if event.event_id.is_empty() {
        event.event_id = Uuid::new_v4().to_string();
    }
    if event.received_at.is_none() {
        event.received_at = Some(OffsetDateTime::now_utc());
    }
    event
}

#[async_trait]
pub trait WebhookStream: Send + Sync {
    /// Appends the event, assigning `event_id`/`received_at` when unset;
    /// returns the stream id.
    async fn publish(&self, event: WebhookEvent) -> Result<String, StreamError>;

    /// Reads up to `count` new messages for this consumer, blocking up
    /// to `block` when none are ready.
    async fn consume(
        &self,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError>;

    async fn ack(&self, ids: &[String]) -> Result<(), StreamError>;

    /// Claims messages pending longer than `min_idle` from any consumer.
    async fn claim_stale(
        &self,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamError>;

    /// Records the entry on the DLQ and acks the original.
    async fn move_to_dead_letter(
        &self,
        entry: &StreamEntry,
        reason: &str,
    ) -> Result<(), StreamError>;

    /// Moves up to `count` DLQ records back onto the main stream.
    async fn replay_from_dlq(&self, count: usize) -> Result<u64, StreamError>;

    /// Messages delivered but not yet acked, across all consumers.
    async fn pending_count(&self) -> Result<u64, StreamError>;

    /// Operator view of the dead-letter stream.
    async fn dead_letters(&self, count: usize) -> Result<Vec<DeadLetterRecord>, StreamError>;
}
