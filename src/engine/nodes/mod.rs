pub mod code;
pub mod condition;
pub mod delay;
pub mod http;
pub mod log;
pub mod transform;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::engine::registry::{NodeContext, NodeError, NodeHandler, NodeRegistry};

/// Trigger nodes do no work of their own; they pass the workflow input
/// downstream so successors can reference it as a node output.
pub struct TriggerNode;

#[async_trait]
impl NodeHandler for TriggerNode {
    async fn execute(&self, ctx: NodeContext) -> Result<Value, NodeError> {
        Ok(ctx
            .input
            .get("$input")
            .cloned()
            .unwrap_or_else(|| json!({})))
    }
}

pub struct NoopNode;

#[async_trait]
impl NodeHandler for NoopNode {
    async fn execute(&self, _ctx: NodeContext) -> Result<Value, NodeError> {
        Ok(json!({}))
    }
}

/// The registry shipped with the worker binary.
pub fn builtin_registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    registry.register("trigger", Arc::new(TriggerNode));
    registry.register("noop", Arc::new(NoopNode));
    registry.register("http_request", Arc::new(http::HttpRequestNode::default()));
    registry.register("delay", Arc::new(delay::DelayNode));
    registry.register("condition", Arc::new(condition::ConditionNode));
    registry.register("code", Arc::new(code::CodeNode));
    registry.register("transform", Arc::new(transform::TransformNode));
    registry.register("log", Arc::new(log::LogNode));
    registry
}
