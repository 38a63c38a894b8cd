use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::workflow_repository::WorkflowRepository;
use crate::models::workflow::{WebhookEndpoint, Workflow};

pub struct PostgresWorkflowRepository {
    pub pool: PgPool,
}

#[async_trait]
impl WorkflowRepository for PostgresWorkflowRepository {
    async fn find_workflow_by_id(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<Workflow>, sqlx::Error> {
        sqlx::query_as::<_, Workflow>(
            r#"
            SELECT id, workspace_id, name, is_active, definition, created_at, updated_at
            FROM workflows
            WHERE id = $1
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn find_webhook_endpoint(
        &self,
        endpoint_id: Uuid,
    ) -> Result<Option<WebhookEndpoint>, sqlx::Error> {
        sqlx::query_as::<_, WebhookEndpoint>(
            r#"
            SELECT id, workflow_id, workspace_id, is_active, created_at
            FROM webhook_endpoints
            WHERE id = $1
            "#,
        )
        .bind(endpoint_id)
        .fetch_optional(&self.pool)
        .await
    }
}
