use async_trait::async_trait;
use uuid::Uuid;

use crate::models::workflow::{WebhookEndpoint, Workflow};

/// Read side of the workflow catalogue, as seen by the pipeline.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    async fn find_workflow_by_id(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<Workflow>, sqlx::Error>;

    async fn find_webhook_endpoint(
        &self,
        endpoint_id: Uuid,
    ) -> Result<Option<WebhookEndpoint>, sqlx::Error>;
}
