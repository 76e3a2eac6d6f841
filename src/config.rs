use std::env;
use std::time::Duration;

/* ============================= DEFAULTS ============================= */

const DEFAULT_SYNC_INTERVAL_SECS: u64 = 10;
const DEFAULT_REDIS_PORT: u16 = 6379;
const DEFAULT_REDIS_DB: i64 = 0;
const DEFAULT_KEY_PREFIX: &str = "pod-status";

/* ============================= SETTINGS ============================= */

/// Process-wide operator settings, read once at startup.
///
/// Cluster auth is not configured here: `kube::Client::try_default()` picks
/// in-cluster config when `KUBERNETES_SERVICE_HOST` is set and falls back to
/// the local kubeconfig otherwise.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Requeue interval between reconcile ticks per HotStandbyJob.
    pub sync_interval: Duration,

    /// Pod-state store connection; `None` when `REDIS_HOST` is unset.
    pub redis: Option<RedisSettings>,
}

#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub password: Option<String>,
    pub key_prefix: String,
}

impl Settings {
    pub fn from_env() -> Self {
        let sync_interval = env::var("SYNC_INTERVAL")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_SYNC_INTERVAL_SECS);

        Self {
            sync_interval: Duration::from_secs(sync_interval),
            redis: RedisSettings::from_env(),
        }
    }
}

impl RedisSettings {
    pub fn from_env() -> Option<Self> {
        let host = env::var("REDIS_HOST").ok()?;
        if host.is_empty() {
            return None;
        }

        let port = env::var("REDIS_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(DEFAULT_REDIS_PORT);
        let db = env::var("REDIS_DB")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(DEFAULT_REDIS_DB);
        let password = env::var("REDIS_PASSWORD").ok().filter(|p| !p.is_empty());
        let key_prefix =
            env::var("REDIS_KEY_PREFIX").unwrap_or_else(|_| DEFAULT_KEY_PREFIX.to_string());

        Some(Self {
            host,
            port,
            db,
            password,
            key_prefix,
        })
    }

    /// Connection URL in the `redis://[:password@]host:port/db` form.
    pub fn url(&self) -> String {
        match &self.password {
            Some(pw) => format!("redis://:{}@{}:{}/{}", pw, self.host, self.port, self.db),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/* ============================= TESTS ============================= */
