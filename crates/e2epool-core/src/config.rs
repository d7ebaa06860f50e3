// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the e2epool controller.

use std::net::SocketAddr;
use std::str::FromStr;

/// Controller configuration loaded from environment variables.
///
/// All variables carry the `E2EPOOL_` prefix. `E2EPOOL_DATABASE_URL` and
/// `E2EPOOL_ADMIN_TOKEN` are required; everything else has a default.
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection URL (shared store for all replicas).
    pub database_url: String,
    /// Task broker URL. The finalize queue lives in the shared store, so
    /// this defaults to `database_url`.
    pub broker_url: String,
    /// Bearer token for the admin and internal APIs.
    pub admin_token: String,
    /// Listen address for the HTTP/WS server.
    pub bind_addr: SocketAddr,
    /// Base URL replicas use for the internal agent-dispatch hop.
    pub api_base_url: String,

    /// Age at which a `created` checkpoint is garbage collected.
    pub checkpoint_ttl_seconds: u64,
    /// GC sweep cadence.
    pub gc_interval_seconds: u64,
    /// Reconciler cadence.
    pub reconcile_interval_seconds: u64,
    /// Completion poller cadence.
    pub poller_interval_seconds: u64,
    /// Checkpoints younger than this are skipped by the poller.
    pub poller_min_age_seconds: u64,
    /// Disable the poller when webhooks are authoritative.
    pub poller_enabled: bool,
    /// Post-finalize debounce window on `create`.
    pub finalize_cooldown_seconds: u64,
    /// Upper bound for readiness polling after a reset.
    pub readiness_timeout_seconds: u64,
    /// Delay between readiness probes.
    pub readiness_poll_interval_seconds: u64,

    /// Soft per-finalize-task bound (logged when exceeded).
    pub task_soft_time_limit: u64,
    /// Hard per-finalize-task bound; the task is killed and redelivered.
    pub task_hard_time_limit: u64,
    /// Soft per-poller-sweep bound.
    pub poller_soft_time_limit: u64,
    /// Hard per-poller-sweep bound.
    pub poller_hard_time_limit: u64,

    /// Server → agent heartbeat cadence.
    pub ws_heartbeat_interval: u64,
    /// Silence threshold after which an agent socket is dropped.
    pub ws_heartbeat_timeout: u64,
    /// Timeout for outbound HTTP calls (CI, hypervisor, internal hop).
    pub http_timeout: u64,
    /// Page size for periodic table scans.
    pub query_batch_size: i64,

    /// Database pool size.
    pub db_pool_size: u32,
    /// Extra connections allowed beyond the pool size.
    pub db_max_overflow: u32,
    /// Connection max lifetime in seconds (pool recycling).
    pub db_pool_recycle: u64,
    /// Number of concurrent finalize worker loops.
    pub worker_concurrency: usize,

    /// CI adapter selected when a runner row names none.
    pub ci_provider: String,
    /// Global CI base URL; takes priority over per-runner fields.
    pub ci_url: Option<String>,
    /// Global CI management token.
    pub ci_token: Option<String>,
    /// Shared secret for the GitLab webhook (`X-Gitlab-Token`).
    pub gitlab_webhook_secret: Option<String>,
    /// HMAC secret for the GitHub webhook (`X-Hub-Signature-256`).
    pub github_webhook_secret: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("E2EPOOL_DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("E2EPOOL_DATABASE_URL"))?;

        let broker_url =
            std::env::var("E2EPOOL_BROKER_URL").unwrap_or_else(|_| database_url.clone());

        let admin_token = std::env::var("E2EPOOL_ADMIN_TOKEN")
            .map_err(|_| ConfigError::MissingEnvVar("E2EPOOL_ADMIN_TOKEN"))?;

        let bind_addr: SocketAddr = std::env::var("E2EPOOL_BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("E2EPOOL_BIND_ADDR"))?;

        let api_base_url = std::env::var("E2EPOOL_API_BASE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8080".to_string());

        Ok(Self {
            database_url,
            broker_url,
            admin_token,
            bind_addr,
            api_base_url,
            checkpoint_ttl_seconds: env_parse("E2EPOOL_CHECKPOINT_TTL_SECONDS", 1800)?,
            gc_interval_seconds: env_parse("E2EPOOL_GC_INTERVAL_SECONDS", 60)?,
            reconcile_interval_seconds: env_parse("E2EPOOL_RECONCILE_INTERVAL_SECONDS", 120)?,
            poller_interval_seconds: env_parse("E2EPOOL_POLLER_INTERVAL_SECONDS", 20)?,
            poller_min_age_seconds: env_parse("E2EPOOL_POLLER_MIN_AGE_SECONDS", 120)?,
            poller_enabled: env_parse("E2EPOOL_POLLER_ENABLED", true)?,
            finalize_cooldown_seconds: env_parse("E2EPOOL_FINALIZE_COOLDOWN_SECONDS", 5)?,
            readiness_timeout_seconds: env_parse("E2EPOOL_READINESS_TIMEOUT_SECONDS", 120)?,
            readiness_poll_interval_seconds: env_parse(
                "E2EPOOL_READINESS_POLL_INTERVAL_SECONDS",
                5,
            )?,
            task_soft_time_limit: env_parse("E2EPOOL_TASK_SOFT_TIME_LIMIT", 300)?,
            task_hard_time_limit: env_parse("E2EPOOL_TASK_HARD_TIME_LIMIT", 330)?,
            poller_soft_time_limit: env_parse("E2EPOOL_POLLER_SOFT_TIME_LIMIT", 120)?,
            poller_hard_time_limit: env_parse("E2EPOOL_POLLER_HARD_TIME_LIMIT", 150)?,
            ws_heartbeat_interval: env_parse("E2EPOOL_WS_HEARTBEAT_INTERVAL", 30)?,
            ws_heartbeat_timeout: env_parse("E2EPOOL_WS_HEARTBEAT_TIMEOUT", 90)?,
            http_timeout: env_parse("E2EPOOL_HTTP_TIMEOUT", 30)?,
            query_batch_size: env_parse("E2EPOOL_QUERY_BATCH_SIZE", 200)?,
            db_pool_size: env_parse("E2EPOOL_DB_POOL_SIZE", 10)?,
            db_max_overflow: env_parse("E2EPOOL_DB_MAX_OVERFLOW", 5)?,
            db_pool_recycle: env_parse("E2EPOOL_DB_POOL_RECYCLE", 1800)?,
            worker_concurrency: env_parse("E2EPOOL_WORKER_CONCURRENCY", 4)?,
            ci_provider: std::env::var("E2EPOOL_CI_PROVIDER")
                .unwrap_or_else(|_| "gitlab".to_string()),
            ci_url: std::env::var("E2EPOOL_CI_URL").ok(),
            ci_token: std::env::var("E2EPOOL_CI_TOKEN").ok(),
            gitlab_webhook_secret: std::env::var("E2EPOOL_GITLAB_WEBHOOK_SECRET").ok(),
            github_webhook_secret: std::env::var("E2EPOOL_GITHUB_WEBHOOK_SECRET").ok(),
        })
    }
}

fn env_parse<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue(key)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// An environment variable could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    fn set_required(guard: &mut EnvGuard) {
        guard.set("E2EPOOL_DATABASE_URL", "postgres://localhost/e2epool_test");
        guard.set("E2EPOOL_ADMIN_TOKEN", "admin-secret");
    }

    #[test]
    fn test_config_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        set_required(&mut guard);
        guard.remove("E2EPOOL_BROKER_URL");
        guard.remove("E2EPOOL_BIND_ADDR");
        guard.remove("E2EPOOL_CHECKPOINT_TTL_SECONDS");
        guard.remove("E2EPOOL_POLLER_ENABLED");

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "postgres://localhost/e2epool_test");
        assert_eq!(config.broker_url, config.database_url);
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.checkpoint_ttl_seconds, 1800);
        assert_eq!(config.gc_interval_seconds, 60);
        assert_eq!(config.reconcile_interval_seconds, 120);
        assert_eq!(config.poller_interval_seconds, 20);
        assert_eq!(config.poller_min_age_seconds, 120);
        assert!(config.poller_enabled);
        assert_eq!(config.finalize_cooldown_seconds, 5);
        assert_eq!(config.readiness_timeout_seconds, 120);
        assert_eq!(config.task_soft_time_limit, 300);
        assert_eq!(config.task_hard_time_limit, 330);
        assert_eq!(config.ws_heartbeat_interval, 30);
        assert_eq!(config.ws_heartbeat_timeout, 90);
        assert_eq!(config.db_pool_size, 10);
        assert_eq!(config.db_max_overflow, 5);
        assert_eq!(config.ci_provider, "gitlab");
        assert!(config.ci_url.is_none());
    }

    #[test]
    fn test_config_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.remove("E2EPOOL_DATABASE_URL");
        guard.set("E2EPOOL_ADMIN_TOKEN", "admin-secret");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingEnvVar("E2EPOOL_DATABASE_URL")
        ));
    }

    #[test]
    fn test_config_missing_admin_token() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("E2EPOOL_DATABASE_URL", "postgres://localhost/x");
        guard.remove("E2EPOOL_ADMIN_TOKEN");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingEnvVar("E2EPOOL_ADMIN_TOKEN")
        ));
    }

    #[test]
    fn test_config_custom_values() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        set_required(&mut guard);
        guard.set("E2EPOOL_BROKER_URL", "postgres://broker/queue");
        guard.set("E2EPOOL_BIND_ADDR", "127.0.0.1:9999");
        guard.set("E2EPOOL_CHECKPOINT_TTL_SECONDS", "600");
        guard.set("E2EPOOL_POLLER_ENABLED", "false");
        guard.set("E2EPOOL_WORKER_CONCURRENCY", "8");
        guard.set("E2EPOOL_CI_URL", "https://gitlab.example.com");

        let config = Config::from_env().unwrap();

        assert_eq!(config.broker_url, "postgres://broker/queue");
        assert_eq!(config.bind_addr.port(), 9999);
        assert_eq!(config.checkpoint_ttl_seconds, 600);
        assert!(!config.poller_enabled);
        assert_eq!(config.worker_concurrency, 8);
        assert_eq!(config.ci_url.as_deref(), Some("https://gitlab.example.com"));
    }

    #[test]
    fn test_config_invalid_number() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        set_required(&mut guard);
        guard.set("E2EPOOL_GC_INTERVAL_SECONDS", "not_a_number");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue("E2EPOOL_GC_INTERVAL_SECONDS")
        ));
    }

    #[test]
    fn test_config_invalid_bind_addr() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        set_required(&mut guard);
        guard.set("E2EPOOL_BIND_ADDR", "not-an-addr");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue("E2EPOOL_BIND_ADDR")));
    }
}
