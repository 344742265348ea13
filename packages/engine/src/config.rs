use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

/// Engine configuration.
///
/// Defaults suit a single-node deployment; `from_env` overrides them from
/// `JOBS_*` environment variables for hosts that configure via environment.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of workers the manager launches.
    pub worker_count: usize,
    /// Concurrent jobs each worker admits.
    pub max_concurrent_jobs: i32,
    /// Queue poll cadence per worker.
    pub poll_interval: Duration,
    /// Worker liveness write cadence.
    pub heartbeat_interval: Duration,
    /// Heartbeat silence after which a worker is considered dead.
    pub worker_timeout: Duration,
    /// How long a draining worker waits for running jobs before cancelling them.
    pub graceful_shutdown_timeout: Duration,
    /// Restarts the supervisor grants a crashing worker slot.
    pub max_restarts: u32,
    /// In-flight enqueue operations the cron scheduler allows.
    pub scheduler_max_concurrent: usize,
    /// Wall-clock cap when neither job nor function override it.
    pub default_timeout_seconds: i64,
    /// Progress-silence cap when neither job nor function override it.
    pub default_progress_timeout_seconds: i64,
    /// Child memory ceiling when the function does not override it.
    pub default_memory_limit_mb: i64,
    /// Retry budget when the function does not override it.
    pub default_max_retries: i32,
    /// HS256 secret for short-lived execution tokens.
    pub jwt_secret: String,
    /// Extra validity granted past the execution timeout.
    pub jwt_grace: Duration,
    /// Base URL injected into the child for the in-job SDK.
    pub base_url: String,
    /// Namespace used when callers do not specify one.
    pub default_namespace: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            max_concurrent_jobs: 5,
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(10),
            worker_timeout: Duration::from_secs(30),
            graceful_shutdown_timeout: Duration::from_secs(30),
            max_restarts: 5,
            scheduler_max_concurrent: 20,
            default_timeout_seconds: 300,
            default_progress_timeout_seconds: 300,
            default_memory_limit_mb: 256,
            default_max_retries: 0,
            jwt_secret: "insecure-dev-secret".to_string(),
            jwt_grace: Duration::from_secs(30),
            base_url: "http://localhost:8080".to_string(),
            default_namespace: "default".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let defaults = Self::default();

        Ok(Self {
            worker_count: env_parse("JOBS_WORKER_COUNT", defaults.worker_count)?,
            max_concurrent_jobs: env_parse("JOBS_MAX_CONCURRENT", defaults.max_concurrent_jobs)?,
            poll_interval: env_duration_ms("JOBS_POLL_INTERVAL_MS", defaults.poll_interval)?,
            heartbeat_interval: env_duration_ms(
                "JOBS_HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval,
            )?,
            worker_timeout: env_duration_ms("JOBS_WORKER_TIMEOUT_MS", defaults.worker_timeout)?,
            graceful_shutdown_timeout: env_duration_ms(
                "JOBS_SHUTDOWN_TIMEOUT_MS",
                defaults.graceful_shutdown_timeout,
            )?,
            max_restarts: env_parse("JOBS_MAX_RESTARTS", defaults.max_restarts)?,
            scheduler_max_concurrent: env_parse(
                "JOBS_SCHEDULER_MAX_CONCURRENT",
                defaults.scheduler_max_concurrent,
            )?,
            default_timeout_seconds: env_parse(
                "JOBS_DEFAULT_TIMEOUT_SECONDS",
                defaults.default_timeout_seconds,
            )?,
            default_progress_timeout_seconds: env_parse(
                "JOBS_DEFAULT_PROGRESS_TIMEOUT_SECONDS",
                defaults.default_progress_timeout_seconds,
            )?,
            default_memory_limit_mb: env_parse(
                "JOBS_DEFAULT_MEMORY_LIMIT_MB",
                defaults.default_memory_limit_mb,
            )?,
            default_max_retries: env_parse(
                "JOBS_DEFAULT_MAX_RETRIES",
                defaults.default_max_retries,
            )?,
            jwt_secret: env::var("JOBS_JWT_SECRET").context("JOBS_JWT_SECRET must be set")?,
            jwt_grace: env_duration_ms("JOBS_JWT_GRACE_MS", defaults.jwt_grace)?,
            base_url: env::var("JOBS_BASE_URL").unwrap_or(defaults.base_url),
            default_namespace: env::var("JOBS_DEFAULT_NAMESPACE")
                .unwrap_or(defaults.default_namespace),
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{key} must be a valid number")),
        Err(_) => Ok(default),
    }
}

fn env_duration_ms(key: &str, default: Duration) -> Result<Duration> {
    match env::var(key) {
        Ok(raw) => {
            let ms: u64 = raw
                .parse()
                .with_context(|| format!("{key} must be milliseconds"))?;
            Ok(Duration::from_millis(ms))
        }
        Err(_) => Ok(default),
    }
}
