// Server configuration from environment variables

use std::time::Duration;

use loadpool::{RestartBudget, RetryPolicy, WorkerPoolConfig};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to listen on (PORT)
    pub port: u16,

    /// Simulated job duration (JOB_DURATION_MS)
    pub job_duration: Duration,

    /// Allowed CORS origins (CORS_ALLOWED_ORIGINS, comma separated)
    pub cors_allowed_origins: Vec<String>,

    /// Worker pool settings
    pub pool: WorkerPoolConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            job_duration: Duration::from_millis(12_000),
            cors_allowed_origins: Vec::new(),
            pool: WorkerPoolConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from the process environment and `.env`
    pub fn from_env() -> Self {
        // .env is optional
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from any key lookup; unparsable values fall back to defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parse = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());

        let port = lookup("PORT")
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(defaults.port);

        let job_duration = parse("JOB_DURATION_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.job_duration);

        let cors_allowed_origins = lookup("CORS_ALLOWED_ORIGINS")
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.split(',')
                    .map(|origin| origin.trim().to_string())
                    .filter(|origin| !origin.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let mut pool = defaults.pool;
        if let Some(count) = parse("WORKER_COUNT") {
            pool = pool.with_worker_count(count as usize);
        }
        if let Some(name) = lookup("QUEUE_NAME").filter(|s| !s.trim().is_empty()) {
            pool = pool.with_queue_name(name);
        }
        if let Some(concurrency) = parse("WORKER_CONCURRENCY") {
            pool = pool.with_concurrency(concurrency as usize);
        }

        let max_attempts = parse("MAX_ATTEMPTS")
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(pool.retry_policy.max_attempts);
        pool = pool.with_retry_policy(RetryPolicy::exponential().with_max_attempts(max_attempts));

        if let Some(timeout) = parse("JOB_TIMEOUT_MS").filter(|ms| *ms > 0) {
            pool = pool.with_job_timeout(Duration::from_millis(timeout));
        }

        let budget = pool.restart_budget;
        let max_restarts = parse("RESTART_LIMIT")
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(budget.max_restarts);
        let window = parse("RESTART_WINDOW_SECS")
            .map(Duration::from_secs)
            .unwrap_or(budget.window);
        pool = pool.with_restart_budget(RestartBudget::new(max_restarts, window));

        Self {
            port,
            job_duration,
            cors_allowed_origins,
            pool,
        }
    }
}
