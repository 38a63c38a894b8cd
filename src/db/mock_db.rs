//! In-memory repository implementations used by tests and local tooling.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::db::execution_repository::ExecutionRepository;
use crate::db::schedule_repository::ScheduleRepository;
use crate::db::workflow_repository::WorkflowRepository;
use crate::models::execution::{status, Execution, NewExecution};
use crate::models::node_execution::NodeExecution;
use crate::models::schedule::Schedule;
use crate::models::workflow::{WebhookEndpoint, Workflow};

#[derive(Default)]
pub struct MemoryScheduleRepository {
    schedules: Mutex<HashMap<Uuid, Schedule>>,
}

impl MemoryScheduleRepository {
    pub fn insert(&self, schedule: Schedule) {
        self.schedules
            .lock()
            .unwrap()
            .insert(schedule.id, schedule);
    }

    pub fn get(&self, id: Uuid) -> Option<Schedule> {
        self.schedules.lock().unwrap().get(&id).cloned()
    }

    fn due(&self, limit: i64, filter: impl Fn(&Schedule) -> bool) -> Vec<Schedule> {
        let now = OffsetDateTime::now_utc();
        let mut due: Vec<Schedule> = self
            .schedules
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.is_active)
            .filter(|s| s.next_run_at.map(|t| t <= now).unwrap_or(false))
            .filter(|s| filter(s))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_run_at);
        due.truncate(limit.max(0) as usize);
        due
    }
}

#[async_trait]
impl ScheduleRepository for MemoryScheduleRepository {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Schedule>, sqlx::Error> {
        Ok(self.get(id))
    }

    async fn get_due(&self, limit: i64) -> Result<Vec<Schedule>, sqlx::Error> {
        Ok(self.due(limit, |_| true))
    }

    async fn get_due_by_priority(
        &self,
        priority: &str,
        limit: i64,
    ) -> Result<Vec<Schedule>, sqlx::Error> {
        Ok(self.due(limit, |s| s.priority == priority))
    }

    async fn get_due_by_workspace(
        &self,
        workspace_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Schedule>, sqlx::Error> {
        Ok(self.due(limit, |s| s.workspace_id == workspace_id))
    }

    async fn record_run(
        &self,
        id: Uuid,
        next_run_at: OffsetDateTime,
    ) -> Result<(), sqlx::Error> {
        let mut schedules = self.schedules.lock().unwrap();
        if let Some(schedule) = schedules.get_mut(&id) {
            schedule.last_run_at = Some(OffsetDateTime::now_utc());
            schedule.next_run_at = Some(next_run_at);
            schedule.run_count += 1;
            schedule.updated_at = OffsetDateTime::now_utc();
        }
        Ok(())
    }

    async fn update_next_run(
        &self,
        id: Uuid,
        next_run_at: OffsetDateTime,
    ) -> Result<(), sqlx::Error> {
        let mut schedules = self.schedules.lock().unwrap();
        if let Some(schedule) = schedules.get_mut(&id) {
            schedule.next_run_at = Some(next_run_at);
            schedule.updated_at = OffsetDateTime::now_utc();
        }
        Ok(())
    }

    async fn get_stale(&self, threshold: Duration) -> Result<Vec<Schedule>, sqlx::Error> {
        let cutoff = OffsetDateTime::now_utc() - threshold;
        let mut stale: Vec<Schedule> = self
            .schedules
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.is_active)
            .filter(|s| s.next_run_at.map(|t| t < cutoff).unwrap_or(false))
            .filter(|s| match (s.last_run_at, s.next_run_at) {
                (None, _) => true,
                (Some(last), Some(next)) => last < next,
                (Some(_), None) => false,
            })
            .cloned()
            .collect();
        stale.sort_by_key(|s| s.next_run_at);
        Ok(stale)
    }
}

#[derive(Default)]
pub struct MemoryExecutionRepository {
    executions: Mutex<HashMap<Uuid, Execution>>,
    node_executions: Mutex<Vec<NodeExecution>>,
}

impl MemoryExecutionRepository {
    pub fn executions(&self) -> Vec<Execution> {
        self.executions.lock().unwrap().values().cloned().collect()
    }

    pub fn node_executions_for(&self, execution_id: Uuid) -> Vec<NodeExecution> {
        self.node_executions
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.execution_id == execution_id)
            .cloned()
            .collect()
    }

    fn transition(&self, id: Uuid, apply: impl FnOnce(&mut Execution)) -> bool {
        let mut executions = self.executions.lock().unwrap();
        match executions.get_mut(&id) {
            Some(execution) if !status::is_terminal(&execution.status) => {
                apply(execution);
                execution.updated_at = OffsetDateTime::now_utc();
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl ExecutionRepository for MemoryExecutionRepository {
    async fn create_execution(&self, new: NewExecution) -> Result<Execution, sqlx::Error> {
        let now = OffsetDateTime::now_utc();
        let execution = Execution {
            id: Uuid::new_v4(),
            workflow_id: new.workflow_id,
            workspace_id: new.workspace_id,
            triggered_by: new.triggered_by,
            trigger_type: new.trigger_type,
            trigger_data: new.trigger_data,
            input_data: new.input_data,
            status: status::PENDING.to_string(),
            output_data: None,
            error_message: None,
            error_node_id: None,
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        };
        self.executions
            .lock()
            .unwrap()
            .insert(execution.id, execution.clone());
        Ok(execution)
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>, sqlx::Error> {
        Ok(self.executions.lock().unwrap().get(&id).cloned())
    }

    async fn mark_execution_running(&self, id: Uuid) -> Result<bool, sqlx::Error> {
        let mut executions = self.executions.lock().unwrap();
        match executions.get_mut(&id) {
            Some(execution) if execution.status == status::PENDING => {
                execution.status = status::RUNNING.to_string();
                execution.started_at = Some(OffsetDateTime::now_utc());
                execution.updated_at = OffsetDateTime::now_utc();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete_execution(&self, id: Uuid, output: Value) -> Result<bool, sqlx::Error> {
        Ok(self.transition(id, |execution| {
            execution.status = status::COMPLETED.to_string();
            execution.output_data = Some(output);
            execution.finished_at = Some(OffsetDateTime::now_utc());
        }))
    }

    async fn fail_execution(
        &self,
        id: Uuid,
        error: &str,
        error_node_id: Option<&str>,
    ) -> Result<bool, sqlx::Error> {
        let error = error.to_string();
        let error_node_id = error_node_id.map(|s| s.to_string());
        Ok(self.transition(id, move |execution| {
            execution.status = status::FAILED.to_string();
            execution.error_message = Some(error);
            execution.error_node_id = error_node_id;
            execution.finished_at = Some(OffsetDateTime::now_utc());
        }))
    }

    async fn cancel_execution(&self, id: Uuid, reason: &str) -> Result<bool, sqlx::Error> {
        let reason = reason.to_string();
        Ok(self.transition(id, move |execution| {
            execution.status = status::CANCELLED.to_string();
            execution.error_message = Some(reason);
            execution.finished_at = Some(OffsetDateTime::now_utc());
        }))
    }

    async fn create_node_execution(
        &self,
        execution_id: Uuid,
        node_id: &str,
        node_type: &str,
        node_name: Option<&str>,
    ) -> Result<NodeExecution, sqlx::Error> {
        let node_execution = NodeExecution {
            id: Uuid::new_v4(),
            execution_id,
            node_id: node_id.to_string(),
            node_type: node_type.to_string(),
            node_name: node_name.map(|s| s.to_string()),
            status: status::PENDING.to_string(),
            input: None,
            output: None,
            error: None,
            duration_ms: None,
            started_at: None,
            finished_at: None,
            created_at: OffsetDateTime::now_utc(),
        };
        self.node_executions
            .lock()
            .unwrap()
            .push(node_execution.clone());
        Ok(node_execution)
    }

    async fn start_node_execution(
        &self,
        id: Uuid,
        input: Option<Value>,
    ) -> Result<(), sqlx::Error> {
        let mut nodes = self.node_executions.lock().unwrap();
        if let Some(node) = nodes.iter_mut().find(|n| n.id == id) {
            node.status = status::RUNNING.to_string();
            node.input = input;
            node.started_at = Some(OffsetDateTime::now_utc());
        }
        Ok(())
    }

    async fn complete_node_execution(
        &self,
        id: Uuid,
        output: Option<Value>,
        duration_ms: i64,
    ) -> Result<(), sqlx::Error> {
        let mut nodes = self.node_executions.lock().unwrap();
        if let Some(node) = nodes.iter_mut().find(|n| n.id == id) {
            node.status = status::COMPLETED.to_string();
            node.output = output;
            node.duration_ms = Some(duration_ms);
            node.finished_at = Some(OffsetDateTime::now_utc());
        }
        Ok(())
    }

    async fn fail_node_execution(&self, id: Uuid, error: &str) -> Result<(), sqlx::Error> {
        let mut nodes = self.node_executions.lock().unwrap();
        if let Some(node) = nodes.iter_mut().find(|n| n.id == id) {
            node.status = status::FAILED.to_string();
            node.error = Some(error.to_string());
            node.finished_at = Some(OffsetDateTime::now_utc());
        }
        Ok(())
    }

    async fn purge_old_executions(&self, retention_days: i32) -> Result<u64, sqlx::Error> {
        let cutoff =
            OffsetDateTime::now_utc() - Duration::from_secs(retention_days.max(0) as u64 * 86_400);
        let mut executions = self.executions.lock().unwrap();
        let before = executions.len();
        executions.retain(|_, e| {
            !(status::is_terminal(&e.status)
                && e.finished_at.map(|t| t < cutoff).unwrap_or(false))
        });
        Ok((before - executions.len()) as u64)
    }
}

#[derive(Default)]
pub struct MemoryWorkflowRepository {
    workflows: Mutex<HashMap<Uuid, Workflow>>,
    endpoints: Mutex<HashMap<Uuid, WebhookEndpoint>>,
}

impl MemoryWorkflowRepository {
    pub fn insert_workflow(&self, workflow: Workflow) {
        self.workflows
            .lock()
            .unwrap()
            .insert(workflow.id, workflow);
    }

    pub fn insert_endpoint(&self, endpoint: WebhookEndpoint) {
        self.endpoints
            .lock()
            .unwrap()
            .insert(endpoint.id, endpoint);
    }
}

#[async_trait]
impl WorkflowRepository for MemoryWorkflowRepository {
    async fn find_workflow_by_id(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<Workflow>, sqlx::Error> {
        Ok(self.workflows.lock().unwrap().get(&workflow_id).cloned())
    }

    async fn find_webhook_endpoint(
        &self,
        endpoint_id: Uuid,
    ) -> Result<Option<WebhookEndpoint>, sqlx::Error> {
        Ok(self.endpoints.lock().unwrap().get(&endpoint_id).cloned())
    }
}
