//! Outbound HTTP request node.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde_json::{json, Value};

use crate::engine::registry::{NodeContext, NodeError, NodeHandler};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpRequestNode {
    client: reqwest::Client,
}

impl HttpRequestNode {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpRequestNode {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

fn header_map(params: &Value) -> Result<HeaderMap, NodeError> {
    let mut headers = HeaderMap::new();
    if let Some(map) = params.get("headers").and_then(|v| v.as_object()) {
        for (key, value) in map {
            let name = HeaderName::from_str(key)
                .map_err(|_| NodeError::new(format!("invalid header name: {key}")))?;
            let raw = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let value = HeaderValue::from_str(&raw)
                .map_err(|_| NodeError::new(format!("invalid header value for {key}")))?;
            headers.insert(name, value);
        }
    }
    Ok(headers)
}

#[async_trait]
impl NodeHandler for HttpRequestNode {
    async fn execute(&self, ctx: NodeContext) -> Result<Value, NodeError> {
        let params = &ctx.parameters;
        let url = params
            .get("url")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| NodeError::new("http_request requires a url"))?;

        let method_raw = params
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("GET");
        let method = Method::from_str(&method_raw.to_uppercase())
            .map_err(|_| NodeError::new(format!("invalid HTTP method: {method_raw}")))?;

        let timeout = params
            .get("timeout_seconds")
            .and_then(|v| v.as_u64())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT);

        let mut request = self
            .client
            .request(method, url)
            .headers(header_map(params)?)
            .timeout(timeout);

        if let Some(body) = params.get("body") {
            request = match body {
                Value::Null => request,
                Value::String(raw) => request.body(raw.clone()),
                other => request.json(other),
            };
        }

        let response = request
            .send()
            .await
            .map_err(|e| NodeError::new(format!("request failed: {e}")))?;

        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    v.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        let text = response
            .text()
            .await
            .map_err(|e| NodeError::new(format!("unreadable response body: {e}")))?;
        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        Ok(json!({
            "status": status,
            "headers": headers,
            "body": body,
        }))
    }
}
