//! Mediates every persistent execution transition.
//!
//! Transitions are idempotent: applying one to an already-terminal row
//! is a logged no-op that still reports success, so redelivered tasks
//! and duplicate cancels cannot corrupt state.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::db::execution_repository::ExecutionRepository;
use crate::models::execution::{Execution, NewExecution};
use crate::models::node_execution::NodeExecution;

pub struct ExecutionService {
    repo: Arc<dyn ExecutionRepository>,
}

impl ExecutionService {
    pub fn new(repo: Arc<dyn ExecutionRepository>) -> Self {
        Self { repo }
    }

    pub async fn create(&self, new: NewExecution) -> Result<Execution, sqlx::Error> {
        self.repo.create_execution(new).await
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Execution>, sqlx::Error> {
        self.repo.get_execution(id).await
    }

    pub async fn start(&self, id: Uuid) -> Result<(), sqlx::Error> {
        if !self.repo.mark_execution_running(id).await? {
            debug!(execution_id = %id, "start skipped, execution not pending");
        }
        Ok(())
    }

    pub async fn complete(&self, id: Uuid, output: Value) -> Result<(), sqlx::Error> {
        if !self.repo.complete_execution(id, output).await? {
            debug!(execution_id = %id, "complete skipped, execution already terminal");
        }
        Ok(())
    }

    pub async fn fail(
        &self,
        id: Uuid,
        error: &str,
        error_node_id: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        if !self.repo.fail_execution(id, error, error_node_id).await? {
            debug!(execution_id = %id, "fail skipped, execution already terminal");
        }
        Ok(())
    }

    pub async fn cancel(&self, id: Uuid, reason: &str) -> Result<(), sqlx::Error> {
        if !self.repo.cancel_execution(id, reason).await? {
            debug!(execution_id = %id, "cancel skipped, execution already terminal");
        }
        Ok(())
    }

    pub async fn create_node_execution(
        &self,
        execution_id: Uuid,
        node_id: &str,
        node_type: &str,
        node_name: Option<&str>,
    ) -> Result<NodeExecution, sqlx::Error> {
        self.repo
            .create_node_execution(execution_id, node_id, node_type, node_name)
            .await
    }

    pub async fn start_node_execution(
        &self,
        id: Uuid,
        input: Option<Value>,
    ) -> Result<(), sqlx::Error> {
        self.repo.start_node_execution(id, input).await
    }

    pub async fn complete_node_execution(
        &self,
        id: Uuid,
        output: Option<Value>,
        duration_ms: i64,
    ) -> Result<(), sqlx::Error> {
        self.repo
            .complete_node_execution(id, output, duration_ms)
            .await
    }

    pub async fn fail_node_execution(&self, id: Uuid, error: &str) -> Result<(), sqlx::Error> {
        self.repo.fail_node_execution(id, error).await
    }

    pub async fn purge_old_executions(&self, retention_days: i32) -> Result<u64, sqlx::Error> {
        self.repo.purge_old_executions(retention_days).await
    }
}
