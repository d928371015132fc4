use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub keydb: KeyDbConfig,
    #[serde(default)]
    pub cart: CartConfig,
}

// ---------------------------------------------------------------------------
// KeyDB / Redis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct KeyDbConfig {
    /// Connection string (e.g. `redis://localhost:6379`).
    pub endpoint: String,
    /// Enable TLS for the KeyDB connection.
    #[serde(default)]
    pub tls: bool,
    /// Name of the environment variable that holds the KeyDB auth token.
    #[serde(default = "default_keydb_auth_env")]
    pub auth_token_env: String,
    /// Number of pooled connections.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Upper bound (milliseconds) on connecting and the startup PING.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_keydb_auth_env() -> String {
    "KEYDB_AUTH_TOKEN".to_string()
}

fn default_pool_size() -> usize {
    4
}

fn default_connect_timeout_ms() -> u64 {
    100
}

// ---------------------------------------------------------------------------
// Cart behaviour
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CartConfig {
    /// How long (seconds) a cart survives after its last update.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    /// TTL (milliseconds) of the wake-up token pushed when a lock is released.
    #[serde(default = "default_notify_ttl_ms")]
    pub notify_ttl_ms: u64,
    /// Budget (milliseconds) for releasing a lock after a failed update.
    #[serde(default = "default_release_timeout_ms")]
    pub release_timeout_ms: u64,
    /// Deadline (milliseconds) given to a read.
    #[serde(default = "default_request_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Deadline (milliseconds) given to an update, lock wait included.
    #[serde(default = "default_request_timeout_ms")]
    pub update_timeout_ms: u64,
}

impl Default for CartConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention_secs(),
            notify_ttl_ms: default_notify_ttl_ms(),
            release_timeout_ms: default_release_timeout_ms(),
            read_timeout_ms: default_request_timeout_ms(),
            update_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl CartConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn update_timeout(&self) -> Duration {
        Duration::from_millis(self.update_timeout_ms)
    }
}

fn default_retention_secs() -> u64 {
    300
}

fn default_notify_ttl_ms() -> u64 {
    1000
}

fn default_release_timeout_ms() -> u64 {
    500
}

fn default_request_timeout_ms() -> u64 {
    2000
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        !config.keydb.endpoint.is_empty(),
        "keydb.endpoint must not be empty"
    );
    anyhow::ensure!(config.keydb.pool_size > 0, "keydb.pool_size must be > 0");
    anyhow::ensure!(
        config.keydb.connect_timeout_ms > 0,
        "keydb.connect_timeout_ms must be > 0"
    );
    anyhow::ensure!(config.cart.retention_secs > 0, "cart.retention_secs must be > 0");
    anyhow::ensure!(config.cart.notify_ttl_ms > 0, "cart.notify_ttl_ms must be > 0");
    anyhow::ensure!(
        config.cart.update_timeout_ms > 0 && config.cart.read_timeout_ms > 0,
        "cart request timeouts must be > 0"
    );
    Ok(())
}
