//! Credential lookup capability handed to node handlers.
//!
//! The real secret store lives outside this crate; handlers only see
//! this narrow interface.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_credential(&self, id: &str) -> Option<Value>;
}

/// Reads `CREDENTIAL_<ID>` from the environment; JSON values are parsed,
/// anything else is passed through as a string.
pub struct EnvCredentialStore;

#[async_trait]
impl CredentialStore for EnvCredentialStore {
    async fn get_credential(&self, id: &str) -> Option<Value> {
        let key = format!(
            "CREDENTIAL_{}",
            id.to_ascii_uppercase().replace(['-', ' '], "_")
        );
        let raw = std::env::var(key).ok()?;
        Some(serde_json::from_str(&raw).unwrap_or(Value::String(raw)))
    }
}

#[derive(Default)]
pub struct StaticCredentialStore {
    credentials: Mutex<HashMap<String, Value>>,
}

impl StaticCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: impl Into<String>, value: Value) {
        self.credentials.lock().unwrap().insert(id.into(), value);
    }
}

#[async_trait]
impl CredentialStore for StaticCredentialStore {
    async fn get_credential(&self, id: &str) -> Option<Value> {
        self.credentials.lock().unwrap().get(id).cloned()
    }
}
