use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// An inbound webhook as it travels through the buffer stream.
///
/// `event_id` stays stable across redeliveries so downstream consumers
/// can dedupe; the stream id does not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    #[serde(default)]
    pub event_id: String,
    pub endpoint_id: Uuid,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub query: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub received_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub retry_count: u32,
}

impl WebhookEvent {
    pub fn is_json(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.split(';').next().unwrap_or("").trim())
            .map(|mime| mime.eq_ignore_ascii_case("application/json") || mime.ends_with("+json"))
            .unwrap_or(false)
    }
}
