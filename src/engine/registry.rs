//! Node handler contract and the name -> handler registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::services::credentials::CredentialStore;

#[derive(Debug, Error)]
#[error("{message}")]
pub struct NodeError {
    pub message: String,
}

impl NodeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for NodeError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for NodeError {
    fn from(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

/// Capability bundle a handler executes against. Handlers never see the
/// repositories or the queue; everything they may touch is here.
pub struct NodeContext {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub node_id: String,
    /// Composed input: `$input`, `$vars`, and one entry per predecessor.
    pub input: Value,
    /// Parameters with every `{{ ... }}` template already resolved.
    pub parameters: Value,
    pub vars: Map<String, Value>,
    pub credentials: Arc<dyn CredentialStore>,
    /// Observed cooperatively by long-running handlers.
    pub cancel: CancellationToken,
}

impl NodeContext {
    pub async fn get_credential(&self, id: &str) -> Option<Value> {
        self.credentials.get_credential(id).await
    }
}

#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn execute(&self, ctx: NodeContext) -> Result<Value, NodeError>;
}

#[derive(Default)]
pub struct NodeRegistry {
    handlers: HashMap<String, Arc<dyn NodeHandler>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, node_type: impl Into<String>, handler: Arc<dyn NodeHandler>) {
        self.handlers.insert(node_type.into(), handler);
    }

    pub fn get(&self, node_type: &str) -> Option<Arc<dyn NodeHandler>> {
        self.handlers.get(node_type).cloned()
    }

    pub fn registered_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoHandler;

    #[async_trait]
    impl NodeHandler for EchoHandler {
        async fn execute(&self, ctx: NodeContext) -> Result<Value, NodeError> {
            Ok(ctx.parameters)
        }
    }

    #[tokio::test]
    async fn lookup_returns_registered_handler() {
        let mut registry = NodeRegistry::new();
        registry.register("echo", Arc::new(EchoHandler));

        let handler = registry.get("echo").expect("registered");
        let ctx = NodeContext {
            execution_id: Uuid::new_v4(),
            workflow_id: Uuid::new_v4(),
            node_id: "n1".into(),
            input: json!({}),
            parameters: json!({"a": 1}),
            vars: Map::new(),
            credentials: Arc::new(crate::services::credentials::StaticCredentialStore::new()),
            cancel: CancellationToken::new(),
        };
        let output = handler.execute(ctx).await.unwrap();
        assert_eq!(output, json!({"a": 1}));

        assert!(registry.get("missing").is_none());
        assert_eq!(registry.registered_types(), vec!["echo"]);
    }
}
