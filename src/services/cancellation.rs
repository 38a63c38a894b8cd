//! Maps execution ids to cooperative cancellation signals.

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Registered at execution create, cleared on terminal transition.
#[derive(Default)]
pub struct CancellationManager {
    tokens: DashMap<Uuid, CancellationToken>,
}

impl CancellationManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, execution_id: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.insert(execution_id, token.clone());
        token
    }

    /// True when the execution had a live channel to signal.
    pub fn cancel(&self, execution_id: Uuid) -> bool {
        match self.tokens.get(&execution_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn clear(&self, execution_id: Uuid) {
        self.tokens.remove(&execution_id);
    }

    pub fn is_registered(&self, execution_id: Uuid) -> bool {
        self.tokens.contains_key(&execution_id)
    }
}
