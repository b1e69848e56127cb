//! Configuration management for Ratewarden.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::Result;

/// Environment variable holding the shared store connection URL.
pub const REDIS_URL_ENV: &str = "REDIS_URL";

/// Reserved connection URL that forces permanent local-only limiting.
pub const PLACEHOLDER_REDIS_URL: &str = "redis://placeholder";

/// Prefix for environment overrides, e.g. `RATEWARDEN__SERVER__HTTP_ADDR`.
const ENV_PREFIX: &str = "RATEWARDEN";

/// Main configuration for the Ratewarden service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Shared counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// In-process store sweeping
    #[serde(default)]
    pub janitor: JanitorConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Optional path to a YAML policy table replacing the built-in one
    #[serde(default)]
    pub policies_path: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            policies_path: None,
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Shared counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL; absent or placeholder means local-only
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Prefix prepended to every counter key in Redis
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Connection handshake timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Per-command timeout in milliseconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,

    /// How long to skip the shared store after a failure (0 disables)
    #[serde(default)]
    pub outage_backoff_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: default_key_prefix(),
            connect_timeout_ms: default_connect_timeout(),
            command_timeout_ms: default_command_timeout(),
            outage_backoff_ms: 0,
        }
    }
}

fn default_key_prefix() -> String {
    "ratewarden".to_string()
}

fn default_connect_timeout() -> u64 {
    1000
}

fn default_command_timeout() -> u64 {
    250
}

impl StoreConfig {
    /// The connection URL to use, or `None` when the shared store is not configured.
    pub fn shared_store_url(&self) -> Option<&str> {
        self.redis_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty() && *url != PLACEHOLDER_REDIS_URL)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// `None` when the outage backoff is disabled.
    pub fn outage_backoff(&self) -> Option<Duration> {
        (self.outage_backoff_ms > 0).then(|| Duration::from_millis(self.outage_backoff_ms))
    }
}

/// Janitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JanitorConfig {
    /// Sweep interval in seconds
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    60
}

impl JanitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

impl ServiceConfig {
    /// Load configuration from an optional file, `RATEWARDEN__*` variables
    /// and `REDIS_URL`, in increasing precedence.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: ServiceConfig = builder.build()?.try_deserialize()?;
        if let Ok(url) = std::env::var(REDIS_URL_ENV) {
            config.store.redis_url = Some(url);
        }
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()?;
        Ok(config.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(
            config.server.http_addr,
            "127.0.0.1:8080".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(config.store.key_prefix, "ratewarden");
        assert_eq!(config.store.command_timeout(), Duration::from_millis(250));
        assert!(config.store.outage_backoff().is_none());
        assert_eq!(config.janitor.interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_from_yaml_partial() {
        let yaml = r#"
store:
  redis_url: redis://cache.internal:6379
  outage_backoff_ms: 5000
janitor:
  interval_secs: 30
"#;
        let config = ServiceConfig::from_yaml(yaml).unwrap();
        assert_eq!(
            config.store.shared_store_url(),
            Some("redis://cache.internal:6379")
        );
        assert_eq!(config.store.outage_backoff(), Some(Duration::from_secs(5)));
        assert_eq!(config.store.connect_timeout_ms, 1000);
        assert_eq!(config.janitor.interval_secs, 30);
        assert_eq!(config.server.http_addr, default_http_addr());
    }

    #[test]
    fn test_placeholder_url_disables_shared_store() {
        let mut store = StoreConfig::default();
        assert!(store.shared_store_url().is_none());

        store.redis_url = Some(PLACEHOLDER_REDIS_URL.to_string());
        assert!(store.shared_store_url().is_none());

        store.redis_url = Some("   ".to_string());
        assert!(store.shared_store_url().is_none());

        store.redis_url = Some("redis://127.0.0.1:6379".to_string());
        assert_eq!(store.shared_store_url(), Some("redis://127.0.0.1:6379"));
    }

    #[test]
    fn test_zero_sweep_interval_is_clamped() {
        let janitor = JanitorConfig { interval_secs: 0 };
        assert_eq!(janitor.interval(), Duration::from_secs(1));
    }
}
