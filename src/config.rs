//! Application-level configuration loading: backend endpoints plus every tunable of the
//! circuit breaker, state cache, distributed lock and write-behind queue.

use std::{env, fs, io::ErrorKind, path::PathBuf, str::FromStr, time::Duration};

use serde::Deserialize;
use tracing::{info, warn};

/// Default location on disk where the server looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/app.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "BUTTON_BACK_CONFIG_PATH";

/// Which cache backend the resilient client connects to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    /// Remote Redis server (requires the `redis-cache` feature).
    Redis,
    /// In-process backend, useful for local runs and tests.
    Memory,
}

impl FromStr for CacheBackendKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(Self::Redis),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown cache backend `{other}`")),
        }
    }
}

/// Which persistent store holds the durable game and click rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackendKind {
    /// MongoDB (requires the `mongo-store` feature).
    Mongo,
    /// In-process store, useful for local runs and tests.
    Memory,
}

impl FromStr for StoreBackendKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mongo" | "mongodb" => Ok(Self::Mongo),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown store backend `{other}`")),
        }
    }
}

/// Immutable runtime configuration shared across the application.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    /// TCP port the HTTP server binds to.
    pub port: u16,
    /// Cache backend selection.
    pub cache_backend: CacheBackendKind,
    /// Persistent store selection.
    pub store_backend: StoreBackendKind,
    /// Connection URL of the Redis server.
    pub redis_url: String,
    /// Connection URI of the MongoDB deployment.
    pub mongo_uri: String,
    /// MongoDB database name.
    pub mongo_db: String,
    /// Circuit breaker tunables.
    pub circuit: CircuitConfig,
    /// State cache tunables.
    pub cache: CacheConfig,
    /// Distributed lock tunables.
    pub lock: LockConfig,
    /// Write-behind queue and sync worker tunables.
    pub queue: QueueConfig,
    /// Defaults applied to newly created games.
    pub game: GameDefaults,
}

/// Circuit breaker guarding the cache backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time the circuit stays open before a trial call is allowed.
    pub cooldown_ms: u64,
}

/// State cache settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Time-to-live of a cached game state (bounded staleness window).
    pub ttl_secs: u64,
    /// Prefix shared by every key this service writes.
    pub key_prefix: String,
    /// How long startup waits for the cache before warming it.
    pub warm_up_wait_ms: u64,
}

/// Distributed lock settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LockConfig {
    /// Maximum time a writer waits for the per-game lock.
    pub timeout_ms: u64,
    /// Lifetime of a lock record before it expires on its own.
    pub ttl_ms: u64,
    /// Base delay between acquisition attempts.
    pub retry_interval_ms: u64,
}

/// Write-behind queue settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Whether the sync worker runs in this process.
    pub enabled: bool,
    /// Key of the append-only log.
    pub stream_key: String,
    /// Consumer group shared by all sync workers.
    pub group: String,
    /// Name of this process inside the consumer group. Defaults to `worker-<HOSTNAME>`.
    pub consumer: String,
    /// Maximum entries read per iteration.
    pub batch_size: usize,
    /// How long a read blocks when no entry is ready.
    pub block_ms: u64,
}

/// Defaults applied to games created without explicit settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GameDefaults {
    /// Timer duration in seconds.
    pub default_duration_secs: u64,
    /// Per-player cooldown in seconds.
    pub default_cooldown_secs: u64,
}

impl AppConfig {
    /// Load the configuration from disk, then apply environment overrides.
    ///
    /// A missing or unreadable file falls back to the built-in defaults so the server can
    /// always start.
    pub fn load() -> Self {
        let path = resolve_config_path();
        let mut config = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<AppConfig>(&contents) {
                Ok(config) => {
                    info!(path = %path.display(), "loaded configuration file");
                    config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        };
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = env::var("REDIS_URL") {
            self.redis_url = url;
        }
        if let Ok(uri) = env::var("MONGO_URI") {
            self.mongo_uri = uri;
        }
        if let Ok(db) = env::var("MONGO_DB") {
            self.mongo_db = db;
        }
        if let Some(port) = env::var("PORT")
            .or_else(|_| env::var("SERVER_PORT"))
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
        {
            self.port = port;
        }
        if let Ok(value) = env::var("CACHE_BACKEND") {
            match value.parse() {
                Ok(kind) => self.cache_backend = kind,
                Err(err) => warn!(error = %err, "ignoring CACHE_BACKEND override"),
            }
        }
        if let Ok(value) = env::var("STORE_BACKEND") {
            match value.parse() {
                Ok(kind) => self.store_backend = kind,
                Err(err) => warn!(error = %err, "ignoring STORE_BACKEND override"),
            }
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            cache_backend: CacheBackendKind::Redis,
            store_backend: StoreBackendKind::Mongo,
            redis_url: "redis://127.0.0.1:6379".into(),
            mongo_uri: "mongodb://localhost:27017".into(),
            mongo_db: "button".into(),
            circuit: CircuitConfig::default(),
            cache: CacheConfig::default(),
            lock: LockConfig::default(),
            queue: QueueConfig::default(),
            game: GameDefaults::default(),
        }
    }
}

impl CircuitConfig {
    /// Cooldown as a [`Duration`].
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
        }
    }
}

impl CacheConfig {
    /// Cache TTL as a [`Duration`].
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Startup wait for the cache as a [`Duration`].
    pub fn warm_up_wait(&self) -> Duration {
        Duration::from_millis(self.warm_up_wait_ms)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3_600,
            key_prefix: "button".into(),
            warm_up_wait_ms: 10_000,
        }
    }
}

impl LockConfig {
    /// Acquisition timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Lock record lifetime as a [`Duration`].
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Retry delay as a [`Duration`].
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            ttl_ms: 10_000,
            retry_interval_ms: 50,
        }
    }
}

impl QueueConfig {
    /// Blocking read interval as a [`Duration`].
    pub fn block(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stream_key: "button:clicks".into(),
            group: "sync-workers".into(),
            consumer: consumer_for_host(env::var("HOSTNAME").ok().as_deref()),
            batch_size: 50,
            block_ms: 1_000,
        }
    }
}

fn consumer_for_host(host: Option<&str>) -> String {
    match host.map(str::trim).filter(|host| !host.is_empty()) {
        Some(host) => format!("worker-{host}"),
        None => "worker-1".into(),
    }
}

impl GameDefaults {
    /// Default timer duration as a [`Duration`].
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.default_duration_secs)
    }

    /// Default cooldown as a [`Duration`].
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.default_cooldown_secs)
    }
}

impl Default for GameDefaults {
    fn default() -> Self {
        Self {
            default_duration_secs: 43_200,
            default_cooldown_secs: 60,
        }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}
