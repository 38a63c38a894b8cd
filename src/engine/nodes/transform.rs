//! Shapes a new payload from already-resolved templates.

use async_trait::async_trait;
use serde_json::Value;

use crate::engine::registry::{NodeContext, NodeError, NodeHandler};

/// Returns `parameters.fields` as the node output. Template resolution
/// has already run over the whole parameter tree, so every `{{ ... }}`
/// in the mapping is substituted by the time this executes.
pub struct TransformNode;

#[async_trait]
impl NodeHandler for TransformNode {
    async fn execute(&self, ctx: NodeContext) -> Result<Value, NodeError> {
        let fields = ctx
            .parameters
            .get("fields")
            .cloned()
            .ok_or_else(|| NodeError::new("transform requires a fields mapping"))?;
        if !fields.is_object() {
            return Err(NodeError::new("transform fields must be an object"));
        }
        Ok(fields)
    }
}
