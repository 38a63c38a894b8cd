use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

/// Progress of a single execution, published as it advances.
///
/// The variants carry structured payloads; serialization to the wire
/// envelope happens at the publish boundary only.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    Started,
    NodeStarted {
        node_id: String,
        node_name: String,
    },
    NodeCompleted {
        node_id: String,
        duration_ms: i64,
    },
    NodeFailed {
        node_id: String,
        error: String,
    },
    Completed {
        duration_ms: i64,
        node_count: usize,
    },
    Failed {
        error: String,
        node_id: Option<String>,
    },
    /// Part of the published taxonomy for external publishers (e.g. an
    /// API-side cancel acknowledgement). The worker itself reports a
    /// cancelled run as `Failed` with a cancelled message.
    Cancelled {
        reason: String,
    },
    Progress {
        completed: usize,
        total: usize,
    },
}

impl ExecutionEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Started => "execution.started",
            Self::NodeStarted { .. } => "node.started",
            Self::NodeCompleted { .. } => "node.completed",
            Self::NodeFailed { .. } => "node.failed",
            Self::Completed { .. } => "execution.completed",
            Self::Failed { .. } => "execution.failed",
            Self::Cancelled { .. } => "execution.cancelled",
            Self::Progress { .. } => "execution.progress",
        }
    }

    fn node_id(&self) -> Option<&str> {
        match self {
            Self::NodeStarted { node_id, .. }
            | Self::NodeCompleted { node_id, .. }
            | Self::NodeFailed { node_id, .. } => Some(node_id),
            Self::Failed { node_id, .. } => node_id.as_deref(),
            _ => None,
        }
    }

    fn data(&self) -> Value {
        match self {
            Self::Started => json!({}),
            Self::NodeStarted { node_id, node_name } => {
                json!({ "node_id": node_id, "node_name": node_name })
            }
            Self::NodeCompleted {
                node_id,
                duration_ms,
            } => json!({ "node_id": node_id, "duration_ms": duration_ms }),
            Self::NodeFailed { node_id, error } => {
                json!({ "node_id": node_id, "error": error })
            }
            Self::Completed {
                duration_ms,
                node_count,
            } => json!({ "duration_ms": duration_ms, "node_count": node_count }),
            Self::Failed { error, node_id } => {
                json!({ "error": error, "node_id": node_id })
            }
            Self::Cancelled { reason } => json!({ "reason": reason }),
            Self::Progress { completed, total } => {
                json!({ "completed": completed, "total": total })
            }
        }
    }
}

/// The wire form published on `workspace:<uuid>`.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub workspace_id: Uuid,
    pub workflow_id: Uuid,
    pub execution_id: Uuid,
    pub event: ExecutionEvent,
    pub timestamp: OffsetDateTime,
}

impl EventEnvelope {
    pub fn new(
        workspace_id: Uuid,
        workflow_id: Uuid,
        execution_id: Uuid,
        event: ExecutionEvent,
    ) -> Self {
        Self {
            workspace_id,
            workflow_id,
            execution_id,
            event,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn channel(&self) -> String {
        format!("workspace:{}", self.workspace_id)
    }

    pub fn to_json(&self) -> Value {
        json!({
            "type": self.event.event_type(),
            "workspace_id": self.workspace_id,
            "workflow_id": self.workflow_id,
            "execution_id": self.execution_id,
            "node_id": self.event.node_id(),
            "data": self.event.data(),
            "timestamp": self
                .timestamp
                .format(&Rfc3339)
                .unwrap_or_else(|_| self.timestamp.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serializes_type_and_node_id() {
        let envelope = EventEnvelope::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            ExecutionEvent::NodeFailed {
                node_id: "b".into(),
                error: "boom".into(),
            },
        );

        let value = envelope.to_json();
        assert_eq!(value["type"], "node.failed");
        assert_eq!(value["node_id"], "b");
        assert_eq!(value["data"]["error"], "boom");
        assert!(value["timestamp"].as_str().is_some());
    }

    #[test]
    fn cancelled_notice_carries_its_reason() {
        let envelope = EventEnvelope::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            ExecutionEvent::Cancelled {
                reason: "cancelled by operator".into(),
            },
        );

        let value = envelope.to_json();
        assert_eq!(value["type"], "execution.cancelled");
        assert_eq!(value["data"]["reason"], "cancelled by operator");
        assert!(value["node_id"].is_null());
    }

    #[test]
    fn channel_is_workspace_scoped() {
        let workspace_id = Uuid::new_v4();
        let envelope = EventEnvelope::new(
            workspace_id,
            Uuid::new_v4(),
            Uuid::new_v4(),
            ExecutionEvent::Started,
        );
        assert_eq!(envelope.channel(), format!("workspace:{workspace_id}"));
    }
}
