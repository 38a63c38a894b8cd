//! In-memory buffer stream with the same delivery semantics as the
//! Redis implementation; used by tests and the single-binary dev setup.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::models::webhook_event::WebhookEvent;
use crate::stream::{prepare_event, DeadLetterRecord, StreamEntry, StreamError, WebhookStream};

struct PendingEntry {
    event: WebhookEvent,
    #[allow(dead_code)]
    consumer: String,
    delivered_at: Instant,
}

#[derive(Default)]
struct MemoryStreamState {
    next_seq: u64,
    /// Appended but not yet delivered to the group.
    undelivered: Vec<(String, WebhookEvent)>,
    /// Delivered and awaiting ack, keyed by stream id.
    pending: HashMap<String, PendingEntry>,
    dead_letters: Vec<DeadLetterRecord>,
}

pub struct MemoryWebhookStream {
    max_len: usize,
    dlq_max_len: usize,
    state: Mutex<MemoryStreamState>,
}

impl MemoryWebhookStream {
    pub fn new(max_len: usize, dlq_max_len: usize) -> Self {
        Self {
            max_len,
            dlq_max_len,
            state: Mutex::new(MemoryStreamState::default()),
        }
    }

    /// Backdates a pending entry so claim tests don't have to sleep.
    #[cfg(test)]
    pub fn age_pending(&self, id: &str, by: Duration) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.pending.get_mut(id) {
            entry.delivered_at = Instant::now() - by;
        }
    }
}

impl Default for MemoryWebhookStream {
    fn default() -> Self {
        Self::new(100_000, 10_000)
    }
}

#[async_trait]
impl WebhookStream for MemoryWebhookStream {
    async fn publish(&self, event: WebhookEvent) -> Result<String, StreamError> {
        let event = prepare_event(event);
        let mut state = self.state.lock().unwrap();
        state.next_seq += 1;
        let id = format!("{}-0", state.next_seq);
        state.undelivered.push((id.clone(), event));
        // Capped stream: oldest undelivered entries are trimmed first.
        let max_len = self.max_len;
        if state.undelivered.len() > max_len {
            let excess = state.undelivered.len() - max_len;
            state.undelivered.drain(0..excess);
        }
        Ok(id)
    }

    async fn consume(
        &self,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let deadline = Instant::now() + block;
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if !state.undelivered.is_empty() {
                    let take = count.min(state.undelivered.len());
                    let mut entries = Vec::with_capacity(take);
                    let drained: Vec<_> = state.undelivered.drain(0..take).collect();
                    for (id, event) in drained {
                        state.pending.insert(
                            id.clone(),
                            PendingEntry {
                                event: event.clone(),
                                consumer: consumer.to_string(),
                                delivered_at: Instant::now(),
                            },
                        );
                        entries.push(StreamEntry { id, event });
                    }
                    return Ok(entries);
                }
            }
            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn ack(&self, ids: &[String]) -> Result<(), StreamError> {
        let mut state = self.state.lock().unwrap();
        for id in ids {
            state.pending.remove(id);
        }
        Ok(())
    }

    async fn claim_stale(
        &self,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let mut stale_ids: Vec<String> = state
            .pending
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.delivered_at) >= min_idle)
            .map(|(id, _)| id.clone())
            .collect();
        stale_ids.sort();
        stale_ids.truncate(count);

        let mut claimed = Vec::new();
        for id in stale_ids {
            if let Some(entry) = state.pending.get_mut(&id) {
                entry.consumer = consumer.to_string();
                entry.delivered_at = now;
                claimed.push(StreamEntry {
                    id: id.clone(),
                    event: entry.event.clone(),
                });
            }
        }
        Ok(claimed)
    }

    async fn move_to_dead_letter(
        &self,
        entry: &StreamEntry,
        reason: &str,
    ) -> Result<(), StreamError> {
        let mut state = self.state.lock().unwrap();
        state.pending.remove(&entry.id);
        state.dead_letters.push(DeadLetterRecord {
            event: entry.event.clone(),
            original_id: entry.id.clone(),
            reason: reason.to_string(),
            moved_at: OffsetDateTime::now_utc(),
        });
        let dlq_max_len = self.dlq_max_len;
        if state.dead_letters.len() > dlq_max_len {
            let excess = state.dead_letters.len() - dlq_max_len;
            state.dead_letters.drain(0..excess);
        }
        Ok(())
    }

    async fn replay_from_dlq(&self, count: usize) -> Result<u64, StreamError> {
        let records: Vec<DeadLetterRecord> = {
            let mut state = self.state.lock().unwrap();
            let take = count.min(state.dead_letters.len());
            state.dead_letters.drain(0..take).collect()
        };
        let replayed = records.len() as u64;
        for record in records {
            self.publish(record.event).await?;
        }
        Ok(replayed)
    }

    async fn pending_count(&self) -> Result<u64, StreamError> {
        Ok(self.state.lock().unwrap().pending.len() as u64)
    }

    async fn dead_letters(&self, count: usize) -> Result<Vec<DeadLetterRecord>, StreamError> {
        let state = self.state.lock().unwrap();
        Ok(state.dead_letters.iter().take(count).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use uuid::Uuid;

    fn event() -> WebhookEvent {
        WebhookEvent {
            event_id: String::new(),
            endpoint_id: Uuid::new_v4(),
            method: "POST".into(),
            path: "/hooks/x".into(),
            headers: StdHashMap::new(),
            query: StdHashMap::new(),
            body: "{}".into(),
            content_type: Some("application/json".into()),
            received_at: None,
            retry_count: 0,
        }
    }

    #[tokio::test]
    async fn publish_assigns_event_id_and_received_at() {
        let stream = MemoryWebhookStream::default();
        stream.publish(event()).await.unwrap();
        let entries = stream
            .consume("c1", 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].event.event_id.is_empty());
        assert!(entries[0].event.received_at.is_some());
    }

    #[tokio::test]
    async fn message_stays_pending_until_acked() {
        let stream = MemoryWebhookStream::default();
        stream.publish(event()).await.unwrap();
        let entries = stream
            .consume("c1", 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(stream.pending_count().await.unwrap(), 1);

        stream.ack(&[entries[0].id.clone()]).await.unwrap();
        assert_eq!(stream.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stale_pending_message_can_be_claimed() {
        let stream = MemoryWebhookStream::default();
        stream.publish(event()).await.unwrap();
        let entries = stream
            .consume("c1", 10, Duration::from_millis(10))
            .await
            .unwrap();
        stream.age_pending(&entries[0].id, Duration::from_secs(600));

        let claimed = stream
            .claim_stale("c2", Duration::from_secs(300), 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].event.event_id, entries[0].event.event_id);

        // Just-claimed entries are no longer stale.
        let again = stream
            .claim_stale("c3", Duration::from_secs(300), 10)
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn dlq_move_acks_and_replay_restores() {
        let stream = MemoryWebhookStream::default();
        stream.publish(event()).await.unwrap();
        let entries = stream
            .consume("c1", 10, Duration::from_millis(10))
            .await
            .unwrap();

        stream
            .move_to_dead_letter(&entries[0], "enqueue failed: boom")
            .await
            .unwrap();
        assert_eq!(stream.pending_count().await.unwrap(), 0);

        let dead = stream.dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].reason.contains("boom"));

        let replayed = stream.replay_from_dlq(10).await.unwrap();
        assert_eq!(replayed, 1);
        let redelivered = stream
            .consume("c1", 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].event.event_id, entries[0].event.event_id);
    }

    #[tokio::test]
    async fn consume_blocks_then_returns_empty() {
        let stream = MemoryWebhookStream::default();
        let start = Instant::now();
        let entries = stream
            .consume("c1", 10, Duration::from_millis(30))
            .await
            .unwrap();
        assert!(entries.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(25));
    }
}
