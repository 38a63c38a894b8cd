use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::models::execution::{Execution, NewExecution};
use crate::models::node_execution::NodeExecution;

/// Persistent execution and per-node records.
///
/// Transition methods return `false` when the row was already terminal
/// (or missing); callers treat that as a successful no-op.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    async fn create_execution(&self, new: NewExecution) -> Result<Execution, sqlx::Error>;

    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>, sqlx::Error>;

    /// `pending -> running`, stamping `started_at`.
    async fn mark_execution_running(&self, id: Uuid) -> Result<bool, sqlx::Error>;

    async fn complete_execution(&self, id: Uuid, output: Value) -> Result<bool, sqlx::Error>;

    #[cfg_attr(test, mockall::concretize)]
    async fn fail_execution(
        &self,
        id: Uuid,
        error: &str,
        error_node_id: Option<&str>,
    ) -> Result<bool, sqlx::Error>;

    async fn cancel_execution(&self, id: Uuid, reason: &str) -> Result<bool, sqlx::Error>;

    #[cfg_attr(test, mockall::concretize)]
    async fn create_node_execution(
        &self,
        execution_id: Uuid,
        node_id: &str,
        node_type: &str,
        node_name: Option<&str>,
    ) -> Result<NodeExecution, sqlx::Error>;

    async fn start_node_execution(
        &self,
        id: Uuid,
        input: Option<Value>,
    ) -> Result<(), sqlx::Error>;

    async fn complete_node_execution(
        &self,
        id: Uuid,
        output: Option<Value>,
        duration_ms: i64,
    ) -> Result<(), sqlx::Error>;

    async fn fail_node_execution(&self, id: Uuid, error: &str) -> Result<(), sqlx::Error>;

    /// Deletes terminal executions older than the retention window.
    async fn purge_old_executions(&self, retention_days: i32) -> Result<u64, sqlx::Error>;
}
