//! Boolean gate node. The expression in `parameters.expression` has
//! already been template-resolved, so by the time it arrives here it is
//! a boolean, a number, or a string to coerce.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::engine::registry::{NodeContext, NodeError, NodeHandler};

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => {
            let trimmed = s.trim();
            match trimmed.to_ascii_lowercase().as_str() {
                "" | "false" | "0" | "null" => false,
                _ => true,
            }
        }
        Value::Null => false,
        Value::Array(arr) => !arr.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

pub struct ConditionNode;

#[async_trait]
impl NodeHandler for ConditionNode {
    async fn execute(&self, ctx: NodeContext) -> Result<Value, NodeError> {
        let expression = ctx
            .parameters
            .get("expression")
            .ok_or_else(|| NodeError::new("condition requires an expression"))?;
        Ok(json!({ "result": truthy(expression) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn booleans_and_numbers_coerce_directly() {
        assert!(truthy(&json!(true)));
        assert!(!truthy(&json!(false)));
        assert!(truthy(&json!(1)));
        assert!(!truthy(&json!(0)));
    }

    #[test]
    fn strings_follow_common_falsey_forms() {
        assert!(truthy(&json!("yes")));
        assert!(truthy(&json!("true")));
        assert!(!truthy(&json!("false")));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&json!("0")));
    }

    #[test]
    fn containers_are_truthy_when_nonempty() {
        assert!(!truthy(&json!(null)));
        assert!(!truthy(&json!([])));
        assert!(truthy(&json!([1])));
        assert!(!truthy(&json!({})));
        assert!(truthy(&json!({"a": 1})));
    }
}
