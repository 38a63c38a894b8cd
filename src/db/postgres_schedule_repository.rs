use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::db::schedule_repository::ScheduleRepository;
use crate::models::schedule::Schedule;

const SCHEDULE_COLUMNS: &str = "id, workflow_id, workspace_id, name, cron_expression, timezone, \
     priority, input_data, next_run_at, last_run_at, run_count, is_active, created_at, updated_at";

pub struct PostgresScheduleRepository {
    pub pool: PgPool,
}

#[async_trait]
impl ScheduleRepository for PostgresScheduleRepository {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Schedule>, sqlx::Error> {
        sqlx::query_as::<_, Schedule>(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn get_due(&self, limit: i64) -> Result<Vec<Schedule>, sqlx::Error> {
        sqlx::query_as::<_, Schedule>(&format!(
            r#"
            SELECT {SCHEDULE_COLUMNS}
            FROM schedules
            WHERE is_active = true AND next_run_at <= now()
            ORDER BY next_run_at ASC
            LIMIT $1
            "#
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    async fn get_due_by_priority(
        &self,
        priority: &str,
        limit: i64,
    ) -> Result<Vec<Schedule>, sqlx::Error> {
        sqlx::query_as::<_, Schedule>(&format!(
            r#"
            SELECT {SCHEDULE_COLUMNS}
            FROM schedules
            WHERE is_active = true AND next_run_at <= now() AND priority = $1
            ORDER BY next_run_at ASC
            LIMIT $2
            "#
        ))
        .bind(priority)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    async fn get_due_by_workspace(
        &self,
        workspace_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Schedule>, sqlx::Error> {
        sqlx::query_as::<_, Schedule>(&format!(
            r#"
            SELECT {SCHEDULE_COLUMNS}
            FROM schedules
            WHERE is_active = true AND next_run_at <= now() AND workspace_id = $1
            ORDER BY next_run_at ASC
            LIMIT $2
            "#
        ))
        .bind(workspace_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    async fn record_run(
        &self,
        id: Uuid,
        next_run_at: OffsetDateTime,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE schedules
            SET last_run_at = now(),
                next_run_at = $2,
                run_count = run_count + 1,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(next_run_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_next_run(
        &self,
        id: Uuid,
        next_run_at: OffsetDateTime,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE schedules
            SET next_run_at = $2, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(next_run_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_stale(&self, threshold: Duration) -> Result<Vec<Schedule>, sqlx::Error> {
        sqlx::query_as::<_, Schedule>(&format!(
            r#"
            SELECT {SCHEDULE_COLUMNS}
            FROM schedules
            WHERE is_active = true
              AND next_run_at < now() - make_interval(secs => $1)
              AND (last_run_at IS NULL OR last_run_at < next_run_at)
            ORDER BY next_run_at ASC
            "#
        ))
        .bind(threshold.as_secs_f64())
        .fetch_all(&self.pool)
        .await
    }
}
