use std::env;
use std::time::Duration;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_parse(key, default_secs))
}

fn env_millis(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_parse(key, default_ms))
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

/// Scheduler process settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
    /// Admissions per minute across all workspaces.
    pub global_rate_limit: u64,
    /// Admissions per minute for a single workspace.
    pub workspace_rate_limit: u64,
    pub rate_limit_window: Duration,
    pub leader_key: String,
    pub leader_ttl: Duration,
    pub stale_threshold: Duration,
    pub stale_check_interval: Duration,
    pub cleanup_interval: Duration,
    pub retention_days: i32,
    pub shutdown_timeout: Duration,
    /// Poller pauses at this queue depth; resumes below half of it.
    pub max_queue_depth: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
            global_rate_limit: 1000,
            workspace_rate_limit: 100,
            rate_limit_window: Duration::from_secs(60),
            leader_key: "scheduler:leader".to_string(),
            leader_ttl: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(600),
            stale_check_interval: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(3600),
            retention_days: 30,
            shutdown_timeout: Duration::from_secs(30),
            max_queue_depth: 10_000,
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            poll_interval: env_millis(
                "SCHEDULER_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            ),
            batch_size: env_parse("SCHEDULER_BATCH_SIZE", defaults.batch_size),
            global_rate_limit: env_parse("SCHEDULER_GLOBAL_RATE_LIMIT", defaults.global_rate_limit),
            workspace_rate_limit: env_parse(
                "SCHEDULER_WORKSPACE_RATE_LIMIT",
                defaults.workspace_rate_limit,
            ),
            rate_limit_window: env_secs(
                "SCHEDULER_RATE_LIMIT_WINDOW_SECONDS",
                defaults.rate_limit_window.as_secs(),
            ),
            leader_key: env::var("SCHEDULER_LEADER_KEY").unwrap_or(defaults.leader_key),
            leader_ttl: env_secs("SCHEDULER_LEADER_TTL_SECONDS", defaults.leader_ttl.as_secs()),
            stale_threshold: env_secs(
                "SCHEDULER_STALE_THRESHOLD_SECONDS",
                defaults.stale_threshold.as_secs(),
            ),
            stale_check_interval: env_secs(
                "SCHEDULER_STALE_CHECK_INTERVAL_SECONDS",
                defaults.stale_check_interval.as_secs(),
            ),
            cleanup_interval: env_secs(
                "SCHEDULER_CLEANUP_INTERVAL_SECONDS",
                defaults.cleanup_interval.as_secs(),
            ),
            retention_days: env_parse("RUN_RETENTION_DAYS", defaults.retention_days),
            shutdown_timeout: env_secs(
                "SCHEDULER_SHUTDOWN_TIMEOUT_SECONDS",
                defaults.shutdown_timeout.as_secs(),
            ),
            max_queue_depth: env_parse("SCHEDULER_MAX_QUEUE_DEPTH", defaults.max_queue_depth),
        }
    }
}

/// Webhook buffer stream settings.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub enabled: bool,
    pub stream_key: String,
    pub dlq_key: String,
    pub group: String,
    pub max_len: usize,
    pub dlq_max_len: usize,
    pub batch_size: usize,
    pub max_retries: u32,
    pub block_timeout: Duration,
    pub stale_timeout: Duration,
    pub claim_interval: Duration,
    pub consumer_count: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stream_key: "stream:webhooks".to_string(),
            dlq_key: "stream:webhooks:dlq".to_string(),
            group: "webhook-workers".to_string(),
            max_len: 100_000,
            dlq_max_len: 10_000,
            batch_size: 10,
            max_retries: 3,
            block_timeout: Duration::from_secs(5),
            stale_timeout: Duration::from_secs(300),
            claim_interval: Duration::from_secs(30),
            consumer_count: 2,
        }
    }
}

impl StreamConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: env_bool("WEBHOOK_STREAM_ENABLED", defaults.enabled),
            stream_key: env::var("WEBHOOK_STREAM_KEY").unwrap_or(defaults.stream_key),
            dlq_key: env::var("WEBHOOK_STREAM_DLQ_KEY").unwrap_or(defaults.dlq_key),
            group: env::var("WEBHOOK_STREAM_GROUP").unwrap_or(defaults.group),
            max_len: env_parse("WEBHOOK_STREAM_MAX_LEN", defaults.max_len),
            dlq_max_len: env_parse("WEBHOOK_STREAM_DLQ_MAX_LEN", defaults.dlq_max_len),
            batch_size: env_parse("WEBHOOK_STREAM_BATCH_SIZE", defaults.batch_size),
            max_retries: env_parse("WEBHOOK_STREAM_MAX_RETRIES", defaults.max_retries),
            block_timeout: env_secs(
                "WEBHOOK_STREAM_BLOCK_SECONDS",
                defaults.block_timeout.as_secs(),
            ),
            stale_timeout: env_secs(
                "WEBHOOK_STREAM_STALE_TIMEOUT_SECONDS",
                defaults.stale_timeout.as_secs(),
            ),
            claim_interval: env_secs(
                "WEBHOOK_STREAM_CLAIM_INTERVAL_SECONDS",
                defaults.claim_interval.as_secs(),
            ),
            consumer_count: env_parse("WEBHOOK_STREAM_CONSUMER_COUNT", defaults.consumer_count),
        }
    }
}

/// Worker process settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub critical_weight: u32,
    pub default_weight: u32,
    pub low_weight: u32,
    pub node_timeout: Duration,
    /// When set, a failing `{{ ... }}` template fails the node instead of
    /// passing the literal token through.
    pub strict_expressions: bool,
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            critical_weight: 6,
            default_weight: 3,
            low_weight: 1,
            node_timeout: Duration::from_secs(300),
            strict_expressions: false,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            concurrency: env_parse("WORKER_CONCURRENCY", defaults.concurrency),
            critical_weight: env_parse("WORKER_CRITICAL_WEIGHT", defaults.critical_weight),
            default_weight: env_parse("WORKER_DEFAULT_WEIGHT", defaults.default_weight),
            low_weight: env_parse("WORKER_LOW_WEIGHT", defaults.low_weight),
            node_timeout: env_secs("NODE_TIMEOUT_SECONDS", defaults.node_timeout.as_secs()),
            strict_expressions: env_bool("STRICT_EXPRESSIONS", defaults.strict_expressions),
            shutdown_timeout: env_secs(
                "WORKER_SHUTDOWN_TIMEOUT_SECONDS",
                defaults.shutdown_timeout.as_secs(),
            ),
        }
    }
}

pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub scheduler: SchedulerConfig,
    pub stream: StreamConfig,
    pub worker: WorkerConfig,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let redis_url =
            env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());

        Config {
            database_url,
            redis_url,
            scheduler: SchedulerConfig::from_env(),
            stream: StreamConfig::from_env(),
            worker: WorkerConfig::from_env(),
        }
    }
}
