// src/config.rs
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::rabbitmq::topology::TopologyConfig;

pub const CONFIG_FILE_NAME: &str = "bizmq.json";

// Configuration structures
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessagingConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub topology: TopologyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_password")]
    pub password: String,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u16,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_blocked_timeout")]
    pub blocked_connection_timeout_secs: u64,
    #[serde(default = "default_app_id")]
    pub app_id: String,
}

/// Exponential backoff applied by a single `connect()` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_prefetch")]
    pub prefetch_count: u16,
    #[serde(default = "default_join_timeout")]
    pub join_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

// Default values
fn default_host() -> String { "localhost".to_string() }
fn default_port() -> u16 { 5672 }
fn default_vhost() -> String { "/".to_string() }
fn default_username() -> String { "guest".to_string() }
fn default_password() -> String { "guest".to_string() }
fn default_heartbeat() -> u16 { 600 }
fn default_connection_timeout() -> u64 { 10_000 }
fn default_blocked_timeout() -> u64 { 300 }
fn default_app_id() -> String { "bizmq".to_string() }
fn default_max_attempts() -> u32 { 3 }
fn default_initial_delay() -> u64 { 500 }
fn default_max_delay() -> u64 { 5_000 }
fn default_prefetch() -> u16 { 1 }
fn default_join_timeout() -> u64 { 5_000 }
fn default_log_filter() -> String { "info".to_string() }

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            vhost: default_vhost(),
            username: default_username(),
            password: default_password(),
            heartbeat_secs: default_heartbeat(),
            connection_timeout_ms: default_connection_timeout(),
            blocked_connection_timeout_secs: default_blocked_timeout(),
            app_id: default_app_id(),
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            prefetch_count: default_prefetch(),
            join_timeout_ms: default_join_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

impl ConnectionConfig {
    pub fn blocked_connection_timeout(&self) -> Duration {
        Duration::from_secs(self.blocked_connection_timeout_secs)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// `host:port/vhost`, safe to log.
    pub fn endpoint(&self) -> String {
        format!("{}:{}{}", self.host, self.port, self.vhost_path())
    }

    fn vhost_path(&self) -> String {
        if self.vhost.starts_with('/') {
            self.vhost.clone()
        } else {
            format!("/{}", self.vhost)
        }
    }
}

impl ReconnectPolicy {
    /// A policy that tries exactly once.
    pub fn fail_fast() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.initial_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

impl ConsumerConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

impl MessagingConfig {
    /// Loads the config file if one can be found, then applies `.env` and
    /// environment overrides.
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();
        let mut config = match find_config_file() {
            Ok(path) => Self::load_from(&path)?,
            Err(e) => {
                debug!("{}; using built-in defaults", e);
                Self::default()
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(path)
            .context(format!("Failed to read config file at {}", path.display()))?;

        let config: MessagingConfig = serde_json::from_str(&config_content)
            .context("Configuration file contains invalid JSON or missing required fields")?;
        config.validate()?;

        info!("Loaded messaging configuration from {}", path.display());
        Ok(config)
    }

    /// Applies `RABBITMQ_*` overrides looked up through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let conn = &mut self.connection;
        if let Some(host) = lookup("RABBITMQ_HOST") {
            conn.host = host;
        }
        if let Some(port) = lookup("RABBITMQ_PORT") {
            conn.port = port
                .parse()
                .context(format!("RABBITMQ_PORT is not a valid port: {}", port))?;
        }
        if let Some(username) = lookup("RABBITMQ_USERNAME") {
            conn.username = username;
        }
        if let Some(password) = lookup("RABBITMQ_PASSWORD") {
            conn.password = password;
        }
        if let Some(vhost) = lookup("RABBITMQ_VHOST") {
            conn.vhost = vhost;
        }
        if let Some(app_id) = lookup("RABBITMQ_APP_ID") {
            conn.app_id = app_id;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.connection.host.is_empty() {
            return Err(anyhow!("Configuration error: connection.host cannot be empty"));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(anyhow!("Configuration error: reconnect.max_attempts must be at least 1"));
        }
        Ok(())
    }
}

// Configuration loading and management functions
pub fn find_config_file() -> Result<PathBuf> {
    let local = Path::new(CONFIG_FILE_NAME).to_path_buf();
    let nested = Path::new("config").join(CONFIG_FILE_NAME);
    let locations = [("Current directory", local), ("Config directory", nested)];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Ok(path.clone());
        }
    }

    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(format!(".{}", CONFIG_FILE_NAME));
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Ok(home_config);
        }
    }

    Err(anyhow!(
        "Could not find {} in the current directory, ./config or the home directory",
        CONFIG_FILE_NAME
    ))
}

pub fn create_default_config_file(path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(&MessagingConfig::default())
        .context("Failed to serialize default configuration")?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create directory at {}", parent.display()))?;
        }
    }

    fs::write(path, json)
        .context(format!("Failed to write configuration to {}", path.display()))?;

    info!("Created default configuration file at: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_broker_recommendations() {
        let config = MessagingConfig::default();
        assert_eq!(config.connection.heartbeat_secs, 600);
        assert_eq!(config.connection.blocked_connection_timeout(), Duration::from_secs(300));
        assert_eq!(config.consumer.prefetch_count, 1);
        assert_eq!(config.consumer.join_timeout(), Duration::from_secs(5));
        assert_eq!(config.connection.endpoint(), "localhost:5672/");
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("RABBITMQ_HOST", "broker.internal"),
            ("RABBITMQ_PORT", "5673"),
            ("RABBITMQ_VHOST", "tenants"),
        ]);
        let mut config = MessagingConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.connection.host, "broker.internal");
        assert_eq!(config.connection.port, 5673);
        assert_eq!(config.connection.endpoint(), "broker.internal:5673/tenants");
        assert_eq!(config.connection.username, "guest");
    }

    #[test]
    fn invalid_port_override_is_rejected() {
        let mut config = MessagingConfig::default();
        let result = config.apply_overrides(|key| {
            (key == "RABBITMQ_PORT").then(|| "not-a-port".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn backoff_doubles_up_to_the_ceiling() {
        let policy = ReconnectPolicy {
            max_attempts: 6,
            initial_delay_ms: 100,
            max_delay_ms: 500,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40), Duration::from_millis(500));
    }

    #[test]
    fn default_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE_NAME);
        create_default_config_file(&path).unwrap();

        let loaded = MessagingConfig::load_from(&path).unwrap();
        assert_eq!(loaded.connection.port, 5672);
        assert_eq!(loaded.topology.exchanges.len(), 2);
    }

    #[test]
    fn zero_attempts_is_invalid() {
        let mut config = MessagingConfig::default();
        config.reconnect.max_attempts = 0;
        assert!(config.validate().is_err());
    }
}
