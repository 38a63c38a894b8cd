//! Leader election over a key-value lock with identity and TTL.
//!
//! At most one scheduler replica holds the key at a time; extension and
//! release are compare-and-set against this replica's identity so an
//! expired-and-stolen lock can never be refreshed or deleted by the old
//! holder.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::{info, warn};
use uuid::Uuid;

#[async_trait]
pub trait LeaderElection: Send + Sync {
    /// Attempts to take the lock; true when this replica became leader.
    async fn try_acquire(&self) -> bool;

    /// Refreshes the TTL if still owned; false means leadership is lost.
    async fn extend(&self) -> bool;

    /// Drops the lock if still owned.
    async fn release(&self);

    /// Local view synchronized with the last acquire/extend.
    fn is_leader(&self) -> bool;
}

const EXTEND_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
    return 0
end
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

pub struct RedisLeaderElection {
    conn: ConnectionManager,
    key: String,
    identity: String,
    ttl: Duration,
    leader: AtomicBool,
}

impl RedisLeaderElection {
    pub fn new(conn: ConnectionManager, key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            conn,
            key: key.into(),
            identity: Uuid::new_v4().to_string(),
            ttl,
            leader: AtomicBool::new(false),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }
}

#[async_trait]
impl LeaderElection for RedisLeaderElection {
    async fn try_acquire(&self) -> bool {
        let mut conn = self.conn.clone();
        let outcome: Result<Option<String>, redis::RedisError> = redis::cmd("SET")
            .arg(&self.key)
            .arg(&self.identity)
            .arg("NX")
            .arg("PX")
            .arg(self.ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await;

        match outcome {
            Ok(Some(_)) => {
                info!(key = %self.key, identity = %self.identity, "acquired leadership");
                self.leader.store(true, Ordering::SeqCst);
                true
            }
            Ok(None) => {
                self.leader.store(false, Ordering::SeqCst);
                false
            }
            Err(err) => {
                warn!(key = %self.key, error = %err, "leader acquire failed");
                self.leader.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    async fn extend(&self) -> bool {
        let mut conn = self.conn.clone();
        let outcome: Result<i64, redis::RedisError> = Script::new(EXTEND_SCRIPT)
            .key(&self.key)
            .arg(&self.identity)
            .arg(self.ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await;

        let extended = match outcome {
            Ok(value) => value == 1,
            Err(err) => {
                warn!(key = %self.key, error = %err, "leader extend failed");
                false
            }
        };

        if !extended && self.leader.load(Ordering::SeqCst) {
            warn!(key = %self.key, identity = %self.identity, "leadership lost");
        }
        self.leader.store(extended, Ordering::SeqCst);
        extended
    }

    async fn release(&self) {
        let mut conn = self.conn.clone();
        let outcome: Result<i64, redis::RedisError> = Script::new(RELEASE_SCRIPT)
            .key(&self.key)
            .arg(&self.identity)
            .invoke_async(&mut conn)
            .await;
        if let Err(err) = outcome {
            warn!(key = %self.key, error = %err, "leader release failed");
        }
        self.leader.store(false, Ordering::SeqCst);
    }

    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }
}
