use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::models::schedule::Schedule;

/// Persistent schedule store.
///
/// The due/stale queries must always hit the source of truth; a cached
/// wrapper is only acceptable for `get_by_id`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Schedule>, sqlx::Error>;

    /// Active schedules with `next_run_at <= now`, ascending, capped.
    async fn get_due(&self, limit: i64) -> Result<Vec<Schedule>, sqlx::Error>;

    async fn get_due_by_priority(
        &self,
        priority: &str,
        limit: i64,
    ) -> Result<Vec<Schedule>, sqlx::Error>;

    async fn get_due_by_workspace(
        &self,
        workspace_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Schedule>, sqlx::Error>;

    /// Atomically stamps `last_run_at = now`, advances `next_run_at`,
    /// and increments `run_count`.
    async fn record_run(&self, id: Uuid, next_run_at: OffsetDateTime)
        -> Result<(), sqlx::Error>;

    /// Moves `next_run_at` only; used by stale recovery.
    async fn update_next_run(
        &self,
        id: Uuid,
        next_run_at: OffsetDateTime,
    ) -> Result<(), sqlx::Error>;

    /// Active schedules whose `next_run_at` fell more than `threshold`
    /// behind and which were never dispatched past it.
    async fn get_stale(&self, threshold: Duration) -> Result<Vec<Schedule>, sqlx::Error>;
}
