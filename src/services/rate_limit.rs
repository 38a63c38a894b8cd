//! Sliding-window rate limiting, per key.
//!
//! The Redis implementation keeps a scored set of admission timestamps
//! per key and prunes it before every decision. A backend failure
//! admits the request (fail-open) so a store outage cannot take the
//! dispatch path down with it.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::warn;

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Whether admitting `n` more events right now would stay within the
    /// window limit; admits them if so.
    async fn allow_n(&self, key: &str, n: u64) -> bool;

    async fn allow(&self, key: &str) -> bool {
        self.allow_n(key, 1).await
    }
}

pub struct RedisSlidingWindowLimiter {
    conn: ConnectionManager,
    prefix: String,
    limit: u64,
    window: Duration,
    sequence: AtomicU64,
}

impl RedisSlidingWindowLimiter {
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>, limit: u64, window: Duration) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            limit,
            window,
            sequence: AtomicU64::new(0),
        }
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

#[async_trait]
impl RateLimiter for RedisSlidingWindowLimiter {
    async fn allow_n(&self, key: &str, n: u64) -> bool {
        if n == 0 {
            return true;
        }
        let redis_key = self.redis_key(key);
        let now_ms = chrono::Utc::now().timestamp_millis();
        let horizon = now_ms - self.window.as_millis() as i64;
        let mut conn = self.conn.clone();

        // Prune-then-count in one atomic round trip.
        let counted: Result<(i64, u64), redis::RedisError> = redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&redis_key)
            .arg("-inf")
            .arg(horizon)
            .cmd("ZCARD")
            .arg(&redis_key)
            .query_async(&mut conn)
            .await;

        let current = match counted {
            Ok((_, count)) => count,
            Err(err) => {
                warn!(%key, error = %err, "rate limit store unavailable, admitting");
                return true;
            }
        };

        if current.saturating_add(n) > self.limit {
            return false;
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for _ in 0..n {
            let member = format!(
                "{now_ms}-{}",
                self.sequence.fetch_add(1, Ordering::Relaxed)
            );
            pipe.cmd("ZADD").arg(&redis_key).arg(now_ms).arg(member);
        }
        pipe.cmd("PEXPIRE")
            .arg(&redis_key)
            .arg(self.window.as_millis() as u64);

        let write: Result<(), redis::RedisError> = pipe.query_async(&mut conn).await;
        if let Err(err) = write {
            warn!(%key, error = %err, "rate limit admission write failed");
        }
        true
    }
}

/// Process-local sliding window; used in tests and single-node setups.
pub struct MemorySlidingWindowLimiter {
    limit: u64,
    window: Duration,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl MemorySlidingWindowLimiter {
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl RateLimiter for MemorySlidingWindowLimiter {
    async fn allow_n(&self, key: &str, n: u64) -> bool {
        if n == 0 {
            return true;
        }
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap();
        let entries = windows.entry(key.to_string()).or_default();
        while let Some(front) = entries.front() {
            if now.duration_since(*front) >= self.window {
                entries.pop_front();
            } else {
                break;
            }
        }
        if (entries.len() as u64).saturating_add(n) > self.limit {
            return false;
        }
        for _ in 0..n {
            entries.push_back(now);
        }
        true
    }
}

/// Admits only when every constituent admits, consulted in order.
pub struct CompositeLimiter {
    limiters: Vec<Arc<dyn RateLimiter>>,
}

impl CompositeLimiter {
    pub fn new(limiters: Vec<Arc<dyn RateLimiter>>) -> Self {
        Self { limiters }
    }
}

#[async_trait]
impl RateLimiter for CompositeLimiter {
    async fn allow_n(&self, key: &str, n: u64) -> bool {
        for limiter in &self.limiters {
            if !limiter.allow_n(key, n).await {
                return false;
            }
        }
        true
    }
}
