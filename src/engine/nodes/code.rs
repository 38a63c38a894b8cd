//! Custom JavaScript node. The snippet runs in a fresh engine context
//! with `input` and `vars` bound; its return value becomes the node
//! output.

use async_trait::async_trait;
use boa_engine::context::Context as JsContext;
use boa_engine::Source;
use serde_json::{json, Value};

use crate::engine::expression::format_js_error;
use crate::engine::registry::{NodeContext, NodeError, NodeHandler};

pub struct CodeNode;

fn run_snippet(code: &str, input: &Value, vars: &Value) -> Result<Value, NodeError> {
    let input_literal = serde_json::to_string(input)
        .map_err(|_| NodeError::new("failed to serialize node input"))?;
    let vars_literal = serde_json::to_string(vars)
        .map_err(|_| NodeError::new("failed to serialize workflow variables"))?;

    let script = format!(
        "const input = {input_literal};\nconst vars = {vars_literal};\nconst __result = (() => {{\n{code}\n}})();\nJSON.stringify(__result);"
    );

    let mut ctx = JsContext::default();
    let result = ctx
        .eval(Source::from_bytes(script.as_bytes()))
        .map_err(|e| NodeError::new(format_js_error(e)))?;

    if result.is_undefined() || result.is_null() {
        return Ok(Value::Null);
    }
    let text = result
        .to_string(&mut ctx)
        .map_err(|e| NodeError::new(format_js_error(e)))?
        .to_std_string()
        .map_err(|_| NodeError::new("code result is not valid utf-8"))?;
    if text.trim().is_empty() || text == "undefined" {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text)))
}

#[async_trait]
impl NodeHandler for CodeNode {
    async fn execute(&self, ctx: NodeContext) -> Result<Value, NodeError> {
        let code = ctx
            .parameters
            .get("code")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| NodeError::new("code node requires a snippet"))?;

        let result = run_snippet(code, &ctx.input, &Value::Object(ctx.vars.clone()))?;
        if result.is_object() {
            Ok(result)
        } else {
            Ok(json!({ "result": result }))
        }
    }
}
