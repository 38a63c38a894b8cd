//! `{{ ... }}` template resolution against an execution environment.
//!
//! Expressions are JavaScript, evaluated with an enumerated set of
//! bindings (`$input`, `$json`, `$node`, `$vars`, `$env`, time values,
//! ids) plus a library of pure helper functions. A string that is one
//! single expression resolves to the value's native type; anything else
//! interpolates stringified values. Resolution errors are soft by
//! default: the literal token stays in place and a warning is logged.

use boa_engine::context::Context as JsContext;
use boa_engine::{JsArgs, JsNativeError, JsResult, JsString, JsValue, NativeFunction, Source};
use chrono::Utc;
use serde_json::{Map, Value};
use sha2::Digest;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ExpressionError {
    #[error("expression '{expression}' failed: {reason}")]
    Evaluation { expression: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    /// Failed expressions keep their literal token.
    Lenient,
    /// Failed expressions surface as node failures.
    Strict,
}

/// The enumerated names visible to expressions. Everything an
/// expression can see is listed here; there is no dynamic lookup into
/// worker state.
#[derive(Debug, Clone)]
pub struct ExpressionEnvironment {
    pub input: Value,
    pub json: Value,
    pub node: Map<String, Value>,
    pub vars: Map<String, Value>,
    pub env: Map<String, Value>,
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
}

impl ExpressionEnvironment {
    pub fn new(execution_id: Uuid, workflow_id: Uuid) -> Self {
        Self {
            input: Value::Null,
            json: Value::Null,
            node: Map::new(),
            vars: Map::new(),
            env: Map::new(),
            execution_id,
            workflow_id,
        }
    }

    fn bindings(&self) -> Vec<(&'static str, Value)> {
        let now = Utc::now();
        vec![
            ("$input", self.input.clone()),
            ("$json", self.json.clone()),
            ("$node", Value::Object(self.node.clone())),
            ("$vars", Value::Object(self.vars.clone())),
            ("$env", Value::Object(self.env.clone())),
            ("$now", Value::String(now.to_rfc3339())),
            ("$today", Value::String(now.format("%Y-%m-%d").to_string())),
            ("$timestamp", Value::from(now.timestamp_millis())),
            ("$executionId", Value::String(self.execution_id.to_string())),
            ("$workflowId", Value::String(self.workflow_id.to_string())),
        ]
    }
}

/// Pure helpers available to every expression.
const PRELUDE: &str = r#"
const upper = (s) => String(s).toUpperCase();
const lower = (s) => String(s).toLowerCase();
const trim = (s) => String(s).trim();
const capitalize = (s) => { const t = String(s); return t.charAt(0).toUpperCase() + t.slice(1); };
const replaceAll = (s, from, to) => String(s).split(from).join(to);
const split = (s, sep) => String(s).split(sep);
const join = (arr, sep) => Array.from(arr).join(sep);
const first = (arr) => arr[0];
const last = (arr) => arr[arr.length - 1];
const unique = (arr) => Array.from(new Set(arr));
const flatten = (arr) => Array.from(arr).flat();
const sum = (arr) => Array.from(arr).reduce((a, b) => a + Number(b), 0);
const avg = (arr) => arr.length ? sum(arr) / arr.length : 0;
const min = (arr) => Math.min(...arr);
const max = (arr) => Math.max(...arr);
const abs = Math.abs;
const round = Math.round;
const floor = Math.floor;
const ceil = Math.ceil;
const keys = (o) => Object.keys(o);
const values = (o) => Object.values(o);
const merge = (a, b) => Object.assign({}, a, b);
const pick = (o, ks) => ks.reduce((acc, k) => { if (k in o) acc[k] = o[k]; return acc; }, {});
const typeOf = (v) => Array.isArray(v) ? 'array' : v === null ? 'null' : typeof v;
const isEmpty = (v) => v == null || v === '' || (Array.isArray(v) && v.length === 0) || (typeof v === 'object' && Object.keys(v).length === 0);
const toNumber = (v) => Number(v);
const toText = (v) => typeof v === 'string' ? v : JSON.stringify(v);
const toBool = (v) => Boolean(v);
const toDate = (v) => new Date(v).toISOString();
const year = (v) => new Date(v).getUTCFullYear();
const month = (v) => new Date(v).getUTCMonth() + 1;
const day = (v) => new Date(v).getUTCDate();
"#;

fn native_string_arg(args: &[JsValue], ctx: &mut JsContext<'_>) -> JsResult<String> {
    Ok(args
        .get_or_undefined(0)
        .to_string(ctx)?
        .to_std_string_escaped())
}

fn js_string(value: String) -> JsValue {
    JsValue::from(JsString::from(value))
}

fn native_md5(_: &JsValue, args: &[JsValue], ctx: &mut JsContext<'_>) -> JsResult<JsValue> {
    let input = native_string_arg(args, ctx)?;
    Ok(js_string(format!("{:x}", md5::compute(input.as_bytes()))))
}

fn native_sha1(_: &JsValue, args: &[JsValue], ctx: &mut JsContext<'_>) -> JsResult<JsValue> {
    let input = native_string_arg(args, ctx)?;
    Ok(js_string(hex::encode(sha1::Sha1::digest(input.as_bytes()))))
}

fn native_sha256(_: &JsValue, args: &[JsValue], ctx: &mut JsContext<'_>) -> JsResult<JsValue> {
    let input = native_string_arg(args, ctx)?;
    Ok(js_string(hex::encode(sha2::Sha256::digest(
        input.as_bytes(),
    ))))
}

fn native_sha512(_: &JsValue, args: &[JsValue], ctx: &mut JsContext<'_>) -> JsResult<JsValue> {
    let input = native_string_arg(args, ctx)?;
    Ok(js_string(hex::encode(sha2::Sha512::digest(
        input.as_bytes(),
    ))))
}

fn native_base64_encode(
    _: &JsValue,
    args: &[JsValue],
    ctx: &mut JsContext<'_>,
) -> JsResult<JsValue> {
    use base64::Engine;
    let input = native_string_arg(args, ctx)?;
    Ok(js_string(
        base64::engine::general_purpose::STANDARD.encode(input.as_bytes()),
    ))
}

fn native_base64_decode(
    _: &JsValue,
    args: &[JsValue],
    ctx: &mut JsContext<'_>,
) -> JsResult<JsValue> {
    use base64::Engine;
    let input = native_string_arg(args, ctx)?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(input.as_bytes())
        .map_err(|e| JsNativeError::typ().with_message(format!("invalid base64: {e}")))?;
    Ok(js_string(String::from_utf8_lossy(&decoded).into_owned()))
}

fn native_url_encode(_: &JsValue, args: &[JsValue], ctx: &mut JsContext<'_>) -> JsResult<JsValue> {
    let input = native_string_arg(args, ctx)?;
    Ok(js_string(urlencoding::encode(&input).into_owned()))
}

fn native_url_decode(_: &JsValue, args: &[JsValue], ctx: &mut JsContext<'_>) -> JsResult<JsValue> {
    let input = native_string_arg(args, ctx)?;
    let decoded = urlencoding::decode(&input)
        .map_err(|e| JsNativeError::typ().with_message(format!("invalid url encoding: {e}")))?;
    Ok(js_string(decoded.into_owned()))
}

fn native_uuid(_: &JsValue, _args: &[JsValue], _ctx: &mut JsContext<'_>) -> JsResult<JsValue> {
    Ok(js_string(Uuid::new_v4().to_string()))
}

fn register_natives(ctx: &mut JsContext<'_>) -> JsResult<()> {
    ctx.register_global_callable("md5", 1, NativeFunction::from_fn_ptr(native_md5))?;
    ctx.register_global_callable("sha1", 1, NativeFunction::from_fn_ptr(native_sha1))?;
    ctx.register_global_callable("sha256", 1, NativeFunction::from_fn_ptr(native_sha256))?;
    ctx.register_global_callable("sha512", 1, NativeFunction::from_fn_ptr(native_sha512))?;
    ctx.register_global_callable(
        "base64Encode",
        1,
        NativeFunction::from_fn_ptr(native_base64_encode),
    )?;
    ctx.register_global_callable(
        "base64Decode",
        1,
        NativeFunction::from_fn_ptr(native_base64_decode),
    )?;
    ctx.register_global_callable("urlEncode", 1, NativeFunction::from_fn_ptr(native_url_encode))?;
    ctx.register_global_callable("urlDecode", 1, NativeFunction::from_fn_ptr(native_url_decode))?;
    ctx.register_global_callable("uuid", 0, NativeFunction::from_fn_ptr(native_uuid))?;
    Ok(())
}

pub struct ExpressionEvaluator {
    mode: ResolveMode,
}

impl ExpressionEvaluator {
    pub fn new(mode: ResolveMode) -> Self {
        Self { mode }
    }

    pub fn lenient() -> Self {
        Self::new(ResolveMode::Lenient)
    }

    /// Resolves every string inside `value`, recursing through objects
    /// and arrays.
    pub fn resolve_value(
        &self,
        value: &Value,
        env: &ExpressionEnvironment,
    ) -> Result<Value, ExpressionError> {
        match value {
            Value::String(template) => self.resolve_str(template, env),
            Value::Array(items) => {
                let mut resolved = Vec::with_capacity(items.len());
                for item in items {
                    resolved.push(self.resolve_value(item, env)?);
                }
                Ok(Value::Array(resolved))
            }
            Value::Object(map) => {
                let mut resolved = Map::with_capacity(map.len());
                for (key, item) in map {
                    resolved.insert(key.clone(), self.resolve_value(item, env)?);
                }
                Ok(Value::Object(resolved))
            }
            other => Ok(other.clone()),
        }
    }

    pub fn resolve_str(
        &self,
        template: &str,
        env: &ExpressionEnvironment,
    ) -> Result<Value, ExpressionError> {
        if !template.contains("{{") {
            return Ok(Value::String(template.to_string()));
        }

        // A lone expression keeps the value's native type.
        let trimmed = template.trim();
        if trimmed.starts_with("{{") && trimmed.ends_with("}}") && trimmed.len() >= 4 {
            let inner = &trimmed[2..trimmed.len() - 2];
            if !inner.contains("{{") && !inner.contains("}}") {
                return match self.evaluate(inner.trim(), env) {
                    Ok(value) => Ok(value),
                    Err(reason) => self.soft_fail(template, inner.trim(), reason),
                };
            }
        }

        let mut out = String::new();
        let mut rest = template;
        while let Some(start) = rest.find("{{") {
            let (head, tail) = rest.split_at(start);
            out.push_str(head);
            match tail.find("}}") {
                Some(end_rel) => {
                    let (token, new_rest) = tail.split_at(end_rel + 2);
                    let expr = token
                        .trim_start_matches("{{")
                        .trim_end_matches("}}")
                        .trim();
                    match self.evaluate(expr, env) {
                        Ok(value) => out.push_str(&stringify(&value)),
                        Err(reason) => {
                            if self.mode == ResolveMode::Strict {
                                return Err(ExpressionError::Evaluation {
                                    expression: expr.to_string(),
                                    reason,
                                });
                            }
                            warn!(expression = %expr, %reason, "expression failed, keeping literal");
                            out.push_str(token);
                        }
                    }
                    rest = new_rest;
                }
                None => {
                    // Unterminated token passes through untouched.
                    out.push_str(tail);
                    rest = "";
                    break;
                }
            }
        }
        out.push_str(rest);
        Ok(Value::String(out))
    }

    fn soft_fail(
        &self,
        template: &str,
        expression: &str,
        reason: String,
    ) -> Result<Value, ExpressionError> {
        if self.mode == ResolveMode::Strict {
            return Err(ExpressionError::Evaluation {
                expression: expression.to_string(),
                reason,
            });
        }
        warn!(expression = %expression, %reason, "expression failed, keeping literal");
        Ok(Value::String(template.to_string()))
    }

    fn evaluate(&self, expression: &str, env: &ExpressionEnvironment) -> Result<Value, String> {
        if expression.is_empty() {
            return Err("empty expression".to_string());
        }

        let mut script = String::new();
        for (name, value) in env.bindings() {
            let literal =
                serde_json::to_string(&value).map_err(|e| format!("environment literal: {e}"))?;
            script.push_str(&format!("const {name} = {literal};\n"));
        }
        script.push_str(PRELUDE);
        script.push_str(&format!("JSON.stringify((() => ({expression}))());"));

        let mut ctx = JsContext::default();
        register_natives(&mut ctx).map_err(|e| e.to_string())?;

        let result = ctx
            .eval(Source::from_bytes(script.as_bytes()))
            .map_err(format_js_error)?;

        if result.is_undefined() || result.is_null() {
            return Ok(Value::Null);
        }
        let text = result
            .to_string(&mut ctx)
            .map_err(format_js_error)?
            .to_std_string()
            .map_err(|_| "expression produced a non-utf8 result".to_string())?;
        if text.trim().is_empty() || text == "undefined" {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| format!("unparseable result '{text}': {e}"))
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub(crate) fn format_js_error(err: boa_engine::JsError) -> String {
    let message = err.to_string();
    if message.trim().is_empty() {
        "JavaScript evaluation error".to_string()
    } else {
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env() -> ExpressionEnvironment {
        let mut env = ExpressionEnvironment::new(Uuid::new_v4(), Uuid::new_v4());
        env.input = json!({"x": 1, "name": "ada"});
        env.json = json!({"items": [1, 2, 3]});
        env.node.insert(
            "fetch".to_string(),
            json!({"status": 200, "body": {"ok": true}}),
        );
        env.vars.insert("greeting".to_string(), json!("hello"));
        env
    }

    #[test]
    fn literal_without_braces_is_unchanged() {
        let evaluator = ExpressionEvaluator::lenient();
        let result = evaluator.resolve_str("plain text", &env()).unwrap();
        assert_eq!(result, json!("plain text"));
    }

    #[test]
    fn single_expression_keeps_native_type() {
        let evaluator = ExpressionEvaluator::lenient();
        assert_eq!(evaluator.resolve_str("{{ 1 + 1 }}", &env()).unwrap(), json!(2));
        assert_eq!(
            evaluator.resolve_str("{{ $json.items }}", &env()).unwrap(),
            json!([1, 2, 3])
        );
        assert_eq!(
            evaluator.resolve_str("{{ 2 > 1 }}", &env()).unwrap(),
            json!(true)
        );
    }

    #[test]
    fn interpolation_coerces_to_string() {
        let evaluator = ExpressionEvaluator::lenient();
        assert_eq!(
            evaluator.resolve_str("x={{ 1 + 1 }}", &env()).unwrap(),
            json!("x=2")
        );
        assert_eq!(
            evaluator
                .resolve_str("{{ $vars.greeting }}, {{ $input.name }}!", &env())
                .unwrap(),
            json!("hello, ada!")
        );
    }

    #[test]
    fn environment_names_resolve() {
        let evaluator = ExpressionEvaluator::lenient();
        assert_eq!(
            evaluator
                .resolve_str("{{ $node.fetch.status }}", &env())
                .unwrap(),
            json!(200)
        );
        assert_eq!(
            evaluator.resolve_str("{{ $input.x + 10 }}", &env()).unwrap(),
            json!(11)
        );
    }

    #[test]
    fn time_and_id_bindings_are_present() {
        let evaluator = ExpressionEvaluator::lenient();
        let environment = env();
        let now = evaluator.resolve_str("{{ $now }}", &environment).unwrap();
        assert!(now.as_str().unwrap().contains('T'));

        let today = evaluator.resolve_str("{{ $today }}", &environment).unwrap();
        assert_eq!(today.as_str().unwrap().len(), 10);

        let timestamp = evaluator
            .resolve_str("{{ $timestamp }}", &environment)
            .unwrap();
        assert!(timestamp.as_i64().unwrap() > 0);

        let execution_id = evaluator
            .resolve_str("{{ $executionId }}", &environment)
            .unwrap();
        assert_eq!(
            execution_id.as_str().unwrap(),
            environment.execution_id.to_string()
        );
    }

    #[test]
    fn helper_library_covers_string_array_and_object() {
        let evaluator = ExpressionEvaluator::lenient();
        let environment = env();
        assert_eq!(
            evaluator
                .resolve_str("{{ upper($input.name) }}", &environment)
                .unwrap(),
            json!("ADA")
        );
        assert_eq!(
            evaluator
                .resolve_str("{{ sum($json.items) }}", &environment)
                .unwrap(),
            json!(6)
        );
        assert_eq!(
            evaluator
                .resolve_str("{{ keys($node.fetch.body) }}", &environment)
                .unwrap(),
            json!(["ok"])
        );
        assert_eq!(
            evaluator
                .resolve_str("{{ typeOf($json.items) }}", &environment)
                .unwrap(),
            json!("array")
        );
    }

    #[test]
    fn hashing_and_encoding_functions_match_known_vectors() {
        let evaluator = ExpressionEvaluator::lenient();
        let environment = env();
        assert_eq!(
            evaluator
                .resolve_str("{{ md5('abc') }}", &environment)
                .unwrap(),
            json!("900150983cd24fb0d6963f7d28e17f72")
        );
        assert_eq!(
            evaluator
                .resolve_str("{{ sha256('abc') }}", &environment)
                .unwrap(),
            json!("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
        assert_eq!(
            evaluator
                .resolve_str("{{ base64Encode('hi') }}", &environment)
                .unwrap(),
            json!("aGk=")
        );
        assert_eq!(
            evaluator
                .resolve_str("{{ base64Decode('aGk=') }}", &environment)
                .unwrap(),
            json!("hi")
        );
        assert_eq!(
            evaluator
                .resolve_str("{{ urlEncode('a b') }}", &environment)
                .unwrap(),
            json!("a%20b")
        );
        let id = evaluator
            .resolve_str("{{ uuid() }}", &environment)
            .unwrap();
        assert_eq!(id.as_str().unwrap().len(), 36);
    }

    #[test]
    fn lenient_mode_preserves_failing_tokens() {
        let evaluator = ExpressionEvaluator::lenient();
        let environment = env();
        assert_eq!(
            evaluator
                .resolve_str("{{ $bogus.field }}", &environment)
                .unwrap(),
            json!("{{ $bogus.field }}")
        );
        assert_eq!(
            evaluator
                .resolve_str("a {{ nope( }} b", &environment)
                .unwrap(),
            json!("a {{ nope( }} b")
        );
    }

    #[test]
    fn strict_mode_surfaces_failures() {
        let evaluator = ExpressionEvaluator::new(ResolveMode::Strict);
        let err = evaluator
            .resolve_str("{{ $bogus.field }}", &env())
            .unwrap_err();
        assert!(err.to_string().contains("$bogus"));
    }

    #[test]
    fn resolve_value_walks_nested_parameters() {
        let evaluator = ExpressionEvaluator::lenient();
        let params = json!({
            "url": "https://api.example.com/users/{{ $input.x }}",
            "body": {"greeting": "{{ $vars.greeting }}", "count": "{{ 2 * 3 }}"},
            "tags": ["{{ upper('a') }}", "fixed"],
            "limit": 5
        });
        let resolved = evaluator.resolve_value(&params, &env()).unwrap();
        assert_eq!(resolved["url"], json!("https://api.example.com/users/1"));
        assert_eq!(resolved["body"]["greeting"], json!("hello"));
        assert_eq!(resolved["body"]["count"], json!(6));
        assert_eq!(resolved["tags"][0], json!("A"));
        assert_eq!(resolved["limit"], json!(5));
    }

    #[test]
    fn unterminated_token_passes_through() {
        let evaluator = ExpressionEvaluator::lenient();
        assert_eq!(
            evaluator.resolve_str("x {{ open", &env()).unwrap(),
            json!("x {{ open")
        );
    }
}
