use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Name der Config-Datei im Arbeitsverzeichnis
pub const CONFIG_FILE_NAME: &str = ".fleetroll.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    #[serde(default)]
    pub rollout: RolloutConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Zugang zur Machines API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// App deren Fleet ausgerollt wird
    pub app: String,
    /// Environment-Variable die das API-Token enthält
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

impl ApiConfig {
    /// Liest das Token aus der konfigurierten Environment-Variable.
    pub fn token(&self) -> Option<String> {
        std::env::var(&self.token_env).ok().filter(|t| !t.is_empty())
    }
}

/// Timeouts, Lease- und Retry-Verhalten eines Rollouts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutConfig {
    pub wait_timeout_secs: u64,
    pub lease_ttl_secs: u64,
    pub lease_release_interval_ms: u64,
    pub lease_release_max_attempts: u32,
    pub rollback_interval_ms: u64,
    /// 0 = unbegrenzt
    pub rollback_max_attempts: u32,
    pub push_forward: bool,
    /// 0 = keine Deadline
    pub deadline_secs: u64,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            wait_timeout_secs: 300,
            lease_ttl_secs: 3600,
            lease_release_interval_ms: 1000,
            lease_release_max_attempts: 60,
            rollback_interval_ms: 1000,
            rollback_max_attempts: 0,
            push_forward: true,
            deadline_secs: 0,
        }
    }
}

impl RolloutConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn lease_release_interval(&self) -> Duration {
        Duration::from_millis(self.lease_release_interval_ms)
    }

    pub fn rollback_interval(&self) -> Duration {
        Duration::from_millis(self.rollback_interval_ms)
    }

    pub fn rollback_max_attempts(&self) -> Option<u32> {
        (self.rollback_max_attempts > 0).then_some(self.rollback_max_attempts)
    }

    pub fn deadline(&self) -> Option<Duration> {
        (self.deadline_secs > 0).then(|| Duration::from_secs(self.deadline_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.machines.dev".to_string()
}

fn default_token_env() -> String {
    "FLY_API_TOKEN".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn load_from_dir(dir: &Path) -> Result<Self, ConfigError> {
        Self::load(&dir.join(CONFIG_FILE_NAME))
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.api.app.trim().is_empty() {
            return Err(ConfigError::Invalid("api.app must not be empty".to_string()));
        }
        if !self.api.base_url.starts_with("http://") && !self.api.base_url.starts_with("https://") {
            return Err(ConfigError::Invalid(format!(
                "api.base_url must start with http:// or https://, got: {}",
                self.api.base_url
            )));
        }
        if self.rollout.lease_release_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "rollout.lease_release_max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
