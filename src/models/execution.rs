use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

pub mod status {
    pub const PENDING: &str = "pending";
    pub const RUNNING: &str = "running";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
    pub const CANCELLED: &str = "cancelled";

    pub fn is_terminal(status: &str) -> bool {
        matches!(status, COMPLETED | FAILED | CANCELLED)
    }
}

pub mod trigger_type {
    pub const MANUAL: &str = "manual";
    pub const SCHEDULE: &str = "schedule";
    pub const WEBHOOK: &str = "webhook";
    pub const SUBWORKFLOW: &str = "subworkflow";
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Execution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub workspace_id: Uuid,
    pub triggered_by: Option<Uuid>,
    pub trigger_type: String,
    pub trigger_data: Option<serde_json::Value>,
    pub input_data: Option<serde_json::Value>,
    pub status: String,
    pub output_data: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub error_node_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Payload for creating an execution row; the repository assigns the id
/// and stamps timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewExecution {
    pub workflow_id: Uuid,
    pub workspace_id: Uuid,
    pub triggered_by: Option<Uuid>,
    pub trigger_type: String,
    pub trigger_data: Option<serde_json::Value>,
    pub input_data: Option<serde_json::Value>,
}
