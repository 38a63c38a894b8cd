//! Redis streams implementation of the webhook buffer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamId, StreamReadOptions, StreamReadReply,
};
use redis::AsyncCommands;
use time::OffsetDateTime;
use tracing::warn;

use crate::config::StreamConfig;
use crate::models::webhook_event::WebhookEvent;
use crate::stream::{prepare_event, DeadLetterRecord, StreamEntry, StreamError, WebhookStream};

const DATA_FIELD: &str = "data";

pub struct RedisWebhookStream {
    conn: ConnectionManager,
    config: StreamConfig,
    group_ready: AtomicBool,
}

impl RedisWebhookStream {
    pub fn new(conn: ConnectionManager, config: StreamConfig) -> Self {
        Self {
            conn,
            config,
            group_ready: AtomicBool::new(false),
        }
    }

    /// Creates the consumer group once; a pre-existing group is fine.
    async fn ensure_group(&self, conn: &mut ConnectionManager) -> Result<(), StreamError> {
        if self.group_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        let created: Result<(), redis::RedisError> = conn
            .xgroup_create_mkstream(&self.config.stream_key, &self.config.group, "$")
            .await;
        match created {
            Ok(()) => {}
            Err(err) if err.to_string().contains("BUSYGROUP") => {}
            Err(err) => return Err(err.into()),
        }
        self.group_ready.store(true, Ordering::Release);
        Ok(())
    }

    fn decode_entry(&self, id: &StreamId) -> Option<StreamEntry> {
        let raw: String = match id.get(DATA_FIELD) {
            Some(raw) => raw,
            None => {
                warn!(stream_id = %id.id, "stream entry missing data field");
                return None;
            }
        };
        match serde_json::from_str::<WebhookEvent>(&raw) {
            Ok(event) => Some(StreamEntry {
                id: id.id.clone(),
                event,
            }),
            Err(err) => {
                warn!(stream_id = %id.id, error = %err, "undecodable stream entry");
                None
            }
        }
    }

    async fn append(
        &self,
        conn: &mut ConnectionManager,
        key: &str,
        max_len: usize,
        payload: &str,
    ) -> Result<String, StreamError> {
        let id: String = redis::cmd("XADD")
            .arg(key)
            .arg("MAXLEN")
            .arg("~")
            .arg(max_len)
            .arg("*")
            .arg(DATA_FIELD)
            .arg(payload)
            .query_async(conn)
            .await?;
        Ok(id)
    }
}

#[async_trait]
impl WebhookStream for RedisWebhookStream {
    async fn publish(&self, event: WebhookEvent) -> Result<String, StreamError> {
        let event = prepare_event(event);
        let payload = serde_json::to_string(&event)?;
        let mut conn = self.conn.clone();
        self.append(
            &mut conn,
            &self.config.stream_key,
            self.config.max_len,
            &payload,
        )
        .await
    }

    async fn consume(
        &self,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let mut conn = self.conn.clone();
        self.ensure_group(&mut conn).await?;

        let options = StreamReadOptions::default()
            .group(&self.config.group, consumer)
            .count(count)
            .block(block.as_millis() as usize);
        let reply: StreamReadReply = conn
            .xread_options(&[&self.config.stream_key], &[">"], &options)
            .await?;

        let mut entries = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                if let Some(entry) = self.decode_entry(&id) {
                    entries.push(entry);
                } else {
                    // Poison payloads must not clog the pending list.
                    let _: i64 = conn
                        .xack(&self.config.stream_key, &self.config.group, &[&id.id])
                        .await?;
                }
            }
        }
        Ok(entries)
    }

    async fn ack(&self, ids: &[String]) -> Result<(), StreamError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .xack(&self.config.stream_key, &self.config.group, ids)
            .await?;
        Ok(())
    }

    async fn claim_stale(
        &self,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let mut conn = self.conn.clone();
        self.ensure_group(&mut conn).await?;

        let options = StreamAutoClaimOptions::default().count(count);
        let reply: StreamAutoClaimReply = conn
            .xautoclaim_options(
                &self.config.stream_key,
                &self.config.group,
                consumer,
                min_idle.as_millis() as usize,
                "0-0",
                options,
            )
            .await?;

        let mut entries = Vec::new();
        for id in reply.claimed {
            if let Some(entry) = self.decode_entry(&id) {
                entries.push(entry);
            } else {
                let _: i64 = conn
                    .xack(&self.config.stream_key, &self.config.group, &[&id.id])
                    .await?;
            }
        }
        Ok(entries)
    }

    async fn move_to_dead_letter(
        &self,
        entry: &StreamEntry,
        reason: &str,
    ) -> Result<(), StreamError> {
        let record = DeadLetterRecord {
            event: entry.event.clone(),
            original_id: entry.id.clone(),
            reason: reason.to_string(),
            moved_at: OffsetDateTime::now_utc(),
        };
        let payload = serde_json::to_string(&record)?;
        let mut conn = self.conn.clone();
        self.append(
            &mut conn,
            &self.config.dlq_key,
            self.config.dlq_max_len,
            &payload,
        )
        .await?;
        let _: i64 = conn
            .xack(&self.config.stream_key, &self.config.group, &[&entry.id])
            .await?;
        Ok(())
    }

    async fn replay_from_dlq(&self, count: usize) -> Result<u64, StreamError> {
        let mut conn = self.conn.clone();
        let ids = redis_xrange(&mut conn, &self.config.dlq_key, count).await?;

        let mut replayed = 0u64;
        for id in ids {
            let raw: Option<String> = id.get(DATA_FIELD);
            let Some(raw) = raw else { continue };
            match serde_json::from_str::<DeadLetterRecord>(&raw) {
                Ok(record) => {
                    let payload = serde_json::to_string(&record.event)?;
                    self.append(
                        &mut conn,
                        &self.config.stream_key,
                        self.config.max_len,
                        &payload,
                    )
                    .await?;
                    let _: i64 = conn.xdel(&self.config.dlq_key, &[&id.id]).await?;
                    replayed += 1;
                }
                Err(err) => {
                    warn!(stream_id = %id.id, error = %err, "undecodable DLQ record");
                }
            }
        }
        Ok(replayed)
    }

    async fn pending_count(&self) -> Result<u64, StreamError> {
        let mut conn = self.conn.clone();
        self.ensure_group(&mut conn).await?;
        let reply: redis::streams::StreamPendingReply = conn
            .xpending(&self.config.stream_key, &self.config.group)
            .await?;
        Ok(reply.count() as u64)
    }

    async fn dead_letters(&self, count: usize) -> Result<Vec<DeadLetterRecord>, StreamError> {
        let mut conn = self.conn.clone();
        let ids = redis_xrange(&mut conn, &self.config.dlq_key, count).await?;
        let mut records = Vec::new();
        for id in ids {
            if let Some(raw) = id.get::<String>(DATA_FIELD) {
                if let Ok(record) = serde_json::from_str::<DeadLetterRecord>(&raw) {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }
}

async fn redis_xrange(
    conn: &mut ConnectionManager,
    key: &str,
    count: usize,
) -> Result<Vec<StreamId>, StreamError> {
    let reply: redis::streams::StreamRangeReply = redis::cmd("XRANGE")
        .arg(key)
        .arg("-")
        .arg("+")
        .arg("COUNT")
        .arg(count)
        .query_async(conn)
        .await?;
    Ok(reply.ids)
}
