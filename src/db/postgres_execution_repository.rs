use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::execution_repository::ExecutionRepository;
use crate::models::execution::{Execution, NewExecution};
use crate::models::node_execution::NodeExecution;

const EXECUTION_COLUMNS: &str = "id, workflow_id, workspace_id, triggered_by, trigger_type, \
     trigger_data, input_data, status, output_data, error_message, error_node_id, started_at, \
     finished_at, created_at, updated_at";

const NODE_EXECUTION_COLUMNS: &str = "id, execution_id, node_id, node_type, node_name, status, \
     input, output, error, duration_ms, started_at, finished_at, created_at";

pub struct PostgresExecutionRepository {
    pub pool: PgPool,
}

#[async_trait]
impl ExecutionRepository for PostgresExecutionRepository {
    async fn create_execution(&self, new: NewExecution) -> Result<Execution, sqlx::Error> {
        sqlx::query_as::<_, Execution>(&format!(
            r#"
            INSERT INTO executions
                (id, workflow_id, workspace_id, triggered_by, trigger_type, trigger_data,
                 input_data, status, created_at, updated_at)
            VALUES (gen_random_uuid(), $1, $2, $3, $4, $5, $6, 'pending', now(), now())
            RETURNING {EXECUTION_COLUMNS}
            "#
        ))
        .bind(new.workflow_id)
        .bind(new.workspace_id)
        .bind(new.triggered_by)
        .bind(&new.trigger_type)
        .bind(new.trigger_data)
        .bind(new.input_data)
        .fetch_one(&self.pool)
        .await
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>, sqlx::Error> {
        sqlx::query_as::<_, Execution>(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn mark_execution_running(&self, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET status = 'running', started_at = now(), updated_at = now()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn complete_execution(&self, id: Uuid, output: Value) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET status = 'completed', output_data = $2, finished_at = now(), updated_at = now()
            WHERE id = $1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(id)
        .bind(output)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn fail_execution(
        &self,
        id: Uuid,
        error: &str,
        error_node_id: Option<&str>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET status = 'failed', error_message = $2, error_node_id = $3,
                finished_at = now(), updated_at = now()
            WHERE id = $1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(error_node_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn cancel_execution(&self, id: Uuid, reason: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET status = 'cancelled', error_message = $2, finished_at = now(), updated_at = now()
            WHERE id = $1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_node_execution(
        &self,
        execution_id: Uuid,
        node_id: &str,
        node_type: &str,
        node_name: Option<&str>,
    ) -> Result<NodeExecution, sqlx::Error> {
        sqlx::query_as::<_, NodeExecution>(&format!(
            r#"
            INSERT INTO node_executions
                (id, execution_id, node_id, node_type, node_name, status, created_at)
            VALUES (gen_random_uuid(), $1, $2, $3, $4, 'pending', now())
            RETURNING {NODE_EXECUTION_COLUMNS}
            "#
        ))
        .bind(execution_id)
        .bind(node_id)
        .bind(node_type)
        .bind(node_name)
        .fetch_one(&self.pool)
        .await
    }

    async fn start_node_execution(
        &self,
        id: Uuid,
        input: Option<Value>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE node_executions
            SET status = 'running', input = $2, started_at = now()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(input)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_node_execution(
        &self,
        id: Uuid,
        output: Option<Value>,
        duration_ms: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE node_executions
            SET status = 'completed', output = $2, duration_ms = $3, finished_at = now()
            WHERE id = $1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(id)
        .bind(output)
        .bind(duration_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_node_execution(&self, id: Uuid, error: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE node_executions
            SET status = 'failed', error = $2, finished_at = now()
            WHERE id = $1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn purge_old_executions(&self, retention_days: i32) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            DELETE FROM executions
            WHERE status IN ('completed', 'failed', 'cancelled')
              AND finished_at < now() - ($1 * interval '1 day')
            "#,
        )
        .bind(retention_days)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
