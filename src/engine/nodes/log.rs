//! Emits a structured log line from inside a workflow.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::engine::registry::{NodeContext, NodeError, NodeHandler};

pub struct LogNode;

#[async_trait]
impl NodeHandler for LogNode {
    async fn execute(&self, ctx: NodeContext) -> Result<Value, NodeError> {
        let message = ctx
            .parameters
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let level = ctx
            .parameters
            .get("level")
            .and_then(|v| v.as_str())
            .unwrap_or("info");

        match level {
            "debug" => debug!(execution_id = %ctx.execution_id, node_id = %ctx.node_id, "{message}"),
            "warn" => warn!(execution_id = %ctx.execution_id, node_id = %ctx.node_id, "{message}"),
            "error" => error!(execution_id = %ctx.execution_id, node_id = %ctx.node_id, "{message}"),
            _ => info!(execution_id = %ctx.execution_id, node_id = %ctx.node_id, "{message}"),
        }

        Ok(json!({ "logged": true, "level": level, "message": message }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::credentials::StaticCredentialStore;
    use serde_json::Map;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn ctx(parameters: Value) -> NodeContext {
        NodeContext {
            execution_id: Uuid::new_v4(),
            workflow_id: Uuid::new_v4(),
            node_id: "log-1".into(),
            input: json!({}),
            parameters,
            vars: Map::new(),
            credentials: Arc::new(StaticCredentialStore::new()),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn output_records_level_and_message() {
        let output = LogNode
            .execute(ctx(json!({"level": "warn", "message": "disk almost full"})))
            .await
            .unwrap();
        assert_eq!(
            output,
            json!({"logged": true, "level": "warn", "message": "disk almost full"})
        );
    }

    #[tokio::test]
    async fn missing_level_falls_back_to_info() {
        let output = LogNode
            .execute(ctx(json!({"message": "checkpoint reached"})))
            .await
            .unwrap();
        assert_eq!(output["level"], "info");
        assert_eq!(output["logged"], true);
    }

    #[tokio::test]
    async fn unknown_level_still_logs_at_info() {
        let output = LogNode
            .execute(ctx(json!({"level": "shout", "message": "hello"})))
            .await
            .unwrap();
        // The handler passes the caller's label through in the output
        // even though the emitted line uses the info level.
        assert_eq!(output["level"], "shout");
    }

    #[tokio::test]
    async fn missing_message_yields_empty_string() {
        let output = LogNode.execute(ctx(json!({}))).await.unwrap();
        assert_eq!(output["message"], "");
    }
}
