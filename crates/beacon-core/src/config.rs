use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_MIN_INTERVAL_SECS: u64 = 1;
pub const DEFAULT_JITTER_MS: u64 = 500;
pub const DEFAULT_SCRIPT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_CONCURRENT_SCRIPTS: usize = 8;
pub const DEFAULT_LOOP_ITERATION_LIMIT: u64 = 10_000_000;
pub const DEFAULT_RECURSION_LIMIT: usize = 512;
pub const DEFAULT_SECRET_KEY: &str = "change-me";

/// Top-level config (beacon.toml + BEACON_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BeaconConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Timing policy shared by every widget instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Refresh interval used when neither the widget nor the instance sets one.
    #[serde(default = "default_interval_secs")]
    pub default_interval_secs: u64,
    /// Lower clamp for any resolved refresh interval.
    #[serde(default = "default_min_interval_secs")]
    pub min_interval_secs: u64,
    /// Upper bound of the uniform random delay added to every arm.
    /// Spreads the startup burst when many instances are restored at once.
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_interval_secs: DEFAULT_INTERVAL_SECS,
            min_interval_secs: DEFAULT_MIN_INTERVAL_SECS,
            jitter_ms: DEFAULT_JITTER_MS,
        }
    }
}

/// Limits applied to every script execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Wall-clock budget per execution; a widget's own timeout wins.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Interpreters allowed to run at the same time across all instances.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_loop_iteration_limit")]
    pub loop_iteration_limit: u64,
    #[serde(default = "default_recursion_limit")]
    pub recursion_limit: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_SCRIPT_TIMEOUT_SECS,
            max_concurrent: DEFAULT_MAX_CONCURRENT_SCRIPTS,
            loop_iteration_limit: DEFAULT_LOOP_ITERATION_LIMIT,
            recursion_limit: DEFAULT_RECURSION_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsConfig {
    /// Passphrase the secret-field cipher key is derived from.
    /// Override with env var: BEACON_SECRETS_KEY
    #[serde(default = "default_secret_key")]
    pub key: String,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            key: default_secret_key(),
        }
    }
}

fn default_interval_secs() -> u64 {
    DEFAULT_INTERVAL_SECS
}
fn default_min_interval_secs() -> u64 {
    DEFAULT_MIN_INTERVAL_SECS
}
fn default_jitter_ms() -> u64 {
    DEFAULT_JITTER_MS
}
fn default_timeout_secs() -> u64 {
    DEFAULT_SCRIPT_TIMEOUT_SECS
}
fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT_SCRIPTS
}
fn default_loop_iteration_limit() -> u64 {
    DEFAULT_LOOP_ITERATION_LIMIT
}
fn default_recursion_limit() -> usize {
    DEFAULT_RECURSION_LIMIT
}
fn default_secret_key() -> String {
    DEFAULT_SECRET_KEY.to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.beacon/beacon.db", home)
}

impl BeaconConfig {
    /// Load config from a TOML file with BEACON_* env var overrides.
    ///
    /// Without an explicit path, `~/.beacon/beacon.toml` is used. A missing
    /// file is not an error: every section has defaults.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: BeaconConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("BEACON_").split("_"))
            .extract()
            .map_err(|e| crate::error::BeaconError::Config(e.to_string()))?;

        Ok(config)
    }

    /// True while the secret passphrase is still the shipped placeholder.
    pub fn uses_default_secret(&self) -> bool {
        self.secrets.key == DEFAULT_SECRET_KEY
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.beacon/beacon.toml", home)
}
