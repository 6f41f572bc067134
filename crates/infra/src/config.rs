//! Queue configuration.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

/// Liveness entries older than this are pruned.
pub const DEFAULT_LIVENESS_WINDOW: Duration = Duration::from_secs(60);

/// Idle back-off between two empty polls.
pub const DEFAULT_WORKER_SLEEP: Duration = Duration::from_millis(100);

/// Queue configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// SQLite database file; parent directories are created on open.
    pub db_path: PathBuf,
    /// How long a worker sleeps when there is nothing to claim.
    pub worker_sleep: Duration,
    /// Run every enqueued job in the caller instead of queueing it.
    pub synchronous: bool,
    /// Workers not heard from within this window are considered gone.
    pub liveness_window: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::for_env("development")
    }
}

impl QueueConfig {
    /// Defaults for a named deployment environment: `db/job_queue/<env>.sqlite3`.
    pub fn for_env(env: &str) -> Self {
        Self {
            db_path: PathBuf::from("db").join("job_queue").join(format!("{env}.sqlite3")),
            worker_sleep: DEFAULT_WORKER_SLEEP,
            synchronous: false,
            liveness_window: DEFAULT_LIVENESS_WINDOW,
        }
    }

    /// Load from `STEPQUEUE_*` environment variables, falling back to defaults.
    ///
    /// - `STEPQUEUE_ENV` (default `development`)
    /// - `STEPQUEUE_DB_PATH`
    /// - `STEPQUEUE_WORKER_SLEEP_MS`
    /// - `STEPQUEUE_SYNCHRONOUS` (`true`/`false`)
    /// - `STEPQUEUE_LIVENESS_SECS`
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let env = lookup("STEPQUEUE_ENV").unwrap_or_else(|| "development".to_string());
        let mut config = Self::for_env(&env);

        if let Some(path) = lookup("STEPQUEUE_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(ms) = lookup("STEPQUEUE_WORKER_SLEEP_MS") {
            let ms: u64 = ms
                .parse()
                .with_context(|| format!("STEPQUEUE_WORKER_SLEEP_MS must be an integer, got {ms:?}"))?;
            config.worker_sleep = Duration::from_millis(ms);
        }
        if let Some(flag) = lookup("STEPQUEUE_SYNCHRONOUS") {
            config.synchronous = flag
                .parse()
                .with_context(|| format!("STEPQUEUE_SYNCHRONOUS must be true or false, got {flag:?}"))?;
        }
        if let Some(secs) = lookup("STEPQUEUE_LIVENESS_SECS") {
            let secs: u64 = secs
                .parse()
                .with_context(|| format!("STEPQUEUE_LIVENESS_SECS must be an integer, got {secs:?}"))?;
            config.liveness_window = Duration::from_secs(secs);
        }

        Ok(config)
    }

    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = path.into();
        self
    }

    pub fn with_worker_sleep(mut self, sleep: Duration) -> Self {
        self.worker_sleep = sleep;
        self
    }

    pub fn with_synchronous(mut self, synchronous: bool) -> Self {
        self.synchronous = synchronous;
        self
    }

    pub fn with_liveness_window(mut self, window: Duration) -> Self {
        self.liveness_window = window;
        self
    }
}
