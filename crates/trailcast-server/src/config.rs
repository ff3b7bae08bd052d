//! Server configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file (`trailcast.toml`, or the path in `TRAILCAST_CONFIG`)
//! - Environment variables (`TRAILCAST_*`, sections separated by `__`)
//!
//! Environment variables win over the file. Broker host and credentials have
//! no defaults; startup fails if they are missing.

use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use trailcast_broker::{AmqpConfig, SupervisorConfig};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A source could not be read or a required value is missing.
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    /// Values were read but are not usable.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Host to bind the viewer endpoint to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Viewer endpoint port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path of the viewer WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Broker connection and consumption.
    pub broker: BrokerConfig,

    /// Presence tracking.
    #[serde(default)]
    pub presence: PresenceConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// Broker configuration.
#[derive(Clone, Deserialize)]
pub struct BrokerConfig {
    /// Broker host.
    pub host: String,

    /// Broker port.
    #[serde(default = "default_broker_port")]
    pub port: u16,

    /// Broker username.
    pub username: String,

    /// Broker password.
    pub password: String,

    /// Virtual host.
    #[serde(default = "default_vhost")]
    pub vhost: String,

    /// Heartbeat interval in seconds.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u16,

    /// Queue name prefix; queues are named `<namespace>_<trail>`.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Trails to consume. Accepts a list or a comma separated string.
    #[serde(default = "default_trails", deserialize_with = "trail_list")]
    pub trails: Vec<String>,

    /// Delay between reconnect attempts in milliseconds.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("vhost", &self.vhost)
            .field("heartbeat_secs", &self.heartbeat_secs)
            .field("namespace", &self.namespace)
            .field("trails", &self.trails)
            .field("retry_delay_ms", &self.retry_delay_ms)
            .finish()
    }
}

// Environment values arrive as plain strings, so trails may come comma separated.
fn trail_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum TrailList {
        Joined(String),
        List(Vec<String>),
    }

    Ok(match TrailList::deserialize(deserializer)? {
        TrailList::Joined(joined) => joined.split(',').map(|t| t.trim().to_string()).collect(),
        TrailList::List(list) => list,
    })
}

/// Presence configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PresenceConfig {
    /// How long a runner stays active without updates, in milliseconds.
    #[serde(default = "default_ttl")]
    pub ttl_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Messages buffered per viewer before deliveries to it are dropped.
    #[serde(default = "default_viewer_buffer")]
    pub viewer_buffer: usize,
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_ws_path() -> String {
    "/".to_string()
}

fn default_broker_port() -> u16 {
    5672
}

fn default_vhost() -> String {
    "/".to_string()
}

fn default_heartbeat_secs() -> u16 {
    60
}

fn default_namespace() -> String {
    "group6".to_string()
}

fn default_trails() -> Vec<String> {
    vec!["default".to_string()]
}

fn default_retry_delay() -> u64 {
    5_000
}

fn default_ttl() -> u64 {
    180_000 // 3 minutes
}

fn default_true() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_viewer_buffer() -> usize {
    64
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self { ttl_ms: default_ttl() }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            viewer_buffer: default_viewer_buffer(),
        }
    }
}

impl Config {
    /// Load configuration from the default file locations and environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed, a required value is
    /// missing, or validation fails.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Self::config_path().as_deref(), None)
    }

    /// Locate the configuration file, if any.
    fn config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("TRAILCAST_CONFIG") {
            return Some(PathBuf::from(shellexpand::tilde(&path).as_ref()));
        }

        let config_paths = [
            "trailcast.toml",
            "/etc/trailcast/trailcast.toml",
            "~/.config/trailcast/trailcast.toml",
        ];

        config_paths
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
    }

    /// Load configuration from an optional file and environment variables.
    ///
    /// `env` replaces the process environment when given.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed, a required value is
    /// missing, or validation fails.
    pub fn load_from(
        file: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = file {
            let path = path.to_str().ok_or_else(|| {
                ConfigError::Invalid(format!("non UTF-8 config path: {}", path.display()))
            })?;
            builder = builder.add_source(::config::File::new(path, ::config::FileFormat::Toml));
        }

        let environment = ::config::Environment::with_prefix("TRAILCAST")
            .prefix_separator("_")
            .separator("__")
            .source(env);

        let config: Config = builder
            .add_source(environment)
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Check that the loaded values are usable.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.broker.host.trim().is_empty() {
            return invalid("broker.host must not be empty");
        }
        if self.broker.username.is_empty() {
            return invalid("broker.username must not be empty");
        }
        if self.broker.trails.is_empty() {
            return invalid("broker.trails must list at least one trail");
        }
        if self.broker.trails.iter().any(|t| t.trim().is_empty()) {
            return invalid("broker.trails must not contain blank names");
        }
        if self.broker.retry_delay_ms == 0 {
            return invalid("broker.retry_delay_ms must be greater than zero");
        }
        if self.presence.ttl_ms == 0 {
            return invalid("presence.ttl_ms must be greater than zero");
        }
        if self.limits.viewer_buffer == 0 {
            return invalid("limits.viewer_buffer must be greater than zero");
        }
        if !self.websocket_path.starts_with('/') {
            return invalid("websocket_path must start with '/'");
        }
        if self.metrics.enabled && self.metrics.port == self.port {
            return invalid("metrics.port must differ from port");
        }

        self.bind_addr()?;
        Ok(())
    }

    /// Get the socket address the viewer endpoint binds to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.addr_with_port(self.port)
    }

    /// Get the socket address the metrics endpoint binds to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn metrics_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.addr_with_port(self.metrics.port)
    }

    fn addr_with_port(&self, port: u16) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.host, port)
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(format!("invalid bind address {}:{}", self.host, port))
            })
    }

    /// Presence TTL.
    #[must_use]
    pub fn presence_ttl(&self) -> Duration {
        Duration::from_millis(self.presence.ttl_ms)
    }

    /// AMQP client settings.
    #[must_use]
    pub fn amqp(&self) -> AmqpConfig {
        AmqpConfig {
            host: self.broker.host.clone(),
            port: self.broker.port,
            username: self.broker.username.clone(),
            password: self.broker.password.clone(),
            vhost: self.broker.vhost.clone(),
            heartbeat_secs: self.broker.heartbeat_secs,
        }
    }

    /// Supervisor settings.
    #[must_use]
    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            namespace: self.broker.namespace.clone(),
            trails: self.broker.trails.clone(),
            retry_delay: Duration::from_millis(self.broker.retry_delay_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [broker]
        host = "rabbitmq"
        username = "relay"
        password = "secret"
    "#;

    fn env(vars: &[(&str, &str)]) -> Option<HashMap<String, String>> {
        Some(
            vars.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.port, 8000);
        assert_eq!(config.websocket_path, "/");
        assert_eq!(config.broker.port, 5672);
        assert_eq!(config.broker.vhost, "/");
        assert_eq!(config.broker.heartbeat_secs, 60);
        assert_eq!(config.broker.namespace, "group6");
        assert_eq!(config.broker.trails, vec!["default".to_string()]);
        assert_eq!(config.presence_ttl(), Duration::from_millis(180_000));
        assert_eq!(config.supervisor().retry_delay, Duration::from_secs(5));
        assert!(config.metrics.enabled);
        assert_eq!(config.metrics.port, 9090);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "127.0.0.1"
            port = 9000

            [broker]
            host = "rabbitmq"
            username = "relay"
            password = "secret"
            trails = ["pr9", "pr21"]

            [presence]
            ttl_ms = 60000
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.bind_addr().unwrap().port(), 9000);
        assert_eq!(config.metrics_addr().unwrap().port(), 9090);
        assert_eq!(config.supervisor().trails, vec!["pr9", "pr21"]);
        assert_eq!(config.presence_ttl(), Duration::from_secs(60));
    }

    #[test]
    fn test_missing_broker_credentials() {
        assert!(toml::from_str::<Config>("port = 8000").is_err());

        let result = Config::load_from(None, env(&[("TRAILCAST_BROKER__HOST", "rabbitmq")]));
        assert!(matches!(result, Err(ConfigError::Load(_))));
    }

    #[test]
    fn test_load_from_env() {
        let config = Config::load_from(
            None,
            env(&[
                ("TRAILCAST_PORT", "30016"),
                ("TRAILCAST_BROKER__HOST", "rabbitmq"),
                ("TRAILCAST_BROKER__USERNAME", "relay"),
                ("TRAILCAST_BROKER__PASSWORD", "secret"),
                ("TRAILCAST_BROKER__TRAILS", "pr9,pr21"),
            ]),
        )
        .unwrap();

        assert_eq!(config.port, 30016);
        assert_eq!(config.broker.host, "rabbitmq");
        assert_eq!(config.broker.trails, vec!["pr9", "pr21"]);
    }

    #[test]
    fn test_env_credentials_stay_verbatim() {
        let config = Config::load_from(
            None,
            env(&[
                ("TRAILCAST_BROKER__HOST", "rabbitmq"),
                ("TRAILCAST_BROKER__USERNAME", "007"),
                ("TRAILCAST_BROKER__PASSWORD", "0123"),
                ("TRAILCAST_BROKER__VHOST", "TRUE"),
                ("TRAILCAST_BROKER__TRAILS", "42"),
                ("TRAILCAST_METRICS__ENABLED", "false"),
            ]),
        )
        .unwrap();

        assert_eq!(config.broker.username, "007");
        assert_eq!(config.broker.password, "0123");
        assert_eq!(config.broker.vhost, "TRUE");
        assert_eq!(config.broker.trails, vec!["42"]);
        assert!(!config.metrics.enabled);

        let result = Config::load_from(
            None,
            env(&[
                ("TRAILCAST_BROKER__HOST", "rabbitmq"),
                ("TRAILCAST_BROKER__USERNAME", "relay"),
                ("TRAILCAST_BROKER__PASSWORD", "secret"),
                ("TRAILCAST_BROKER__TRAILS", "pr9,,pr21"),
            ]),
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validation() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.broker.trails = vec![];
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.metrics.port = config.port;
        assert!(config.validate().is_err());

        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.presence.ttl_ms = 0;
        assert!(config.validate().is_err());

        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.host = "not an address".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_debug_hides_password() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        assert!(!format!("{config:?}").contains("secret"));
    }
}
