//! Server configuration.
//!
//! Configuration is layered:
//! - the first existing file of `relay.toml`, `/etc/relay/relay.toml`,
//!   `~/.config/relay/relay.toml`
//! - environment variables `RELAY__*`, nested with `__`
//!   (e.g. `RELAY__BUS__REDIS_URL`)

use anyhow::{Context, Result};
use relay_core::{BackplaneConfig, RegistryConfig, TrackerConfig};
use relay_protocol::WireFormat;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Default config file locations, in priority order.
pub const CONFIG_PATHS: [&str; 3] = [
    "relay.toml",
    "/etc/relay/relay.toml",
    "~/.config/relay/relay.toml",
];

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "RELAY";

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Backplane behaviour.
    #[serde(default)]
    pub backplane: BackplaneSection,

    /// Shared bus connection.
    #[serde(default)]
    pub bus: BusConfig,

    /// Client transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Backplane configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackplaneSection {
    /// Prefix of client destinations.
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    /// Envelope format used when publishing.
    #[serde(default)]
    pub wire_format: WireFormat,

    /// Maximum active topics per instance.
    #[serde(default = "default_max_topics")]
    pub max_topics: usize,

    /// Maximum topics one session may follow.
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions_per_session: usize,
}

/// Which bus implementation to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusBackend {
    /// In-process bus; a single instance only.
    #[default]
    Memory,
    /// Redis pub/sub shared by every instance.
    Redis,
}

/// Bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Bus backend.
    #[serde(default)]
    pub backend: BusBackend,

    /// Redis connection URL.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Outbound frames buffered per session before it counts as stalled.
    #[serde(default = "default_session_queue_capacity")]
    pub session_queue_capacity: usize,

    /// Maximum inbound WebSocket message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Connection timeout in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_topic_prefix() -> String {
    "/topic".to_string()
}

fn default_max_topics() -> usize {
    10_000
}

fn default_max_subscriptions() -> usize {
    100
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_session_queue_capacity() -> usize {
    256
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_heartbeat_timeout() -> u64 {
    60_000 // 60 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backplane: BackplaneSection::default(),
            bus: BusConfig::default(),
            transport: TransportConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for BackplaneSection {
    fn default() -> Self {
        Self {
            topic_prefix: default_topic_prefix(),
            wire_format: WireFormat::default(),
            max_topics: default_max_topics(),
            max_subscriptions_per_session: default_max_subscriptions(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: BusBackend::default(),
            redis_url: default_redis_url(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            session_queue_capacity: default_session_queue_capacity(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
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

impl BackplaneSection {
    /// Core backplane configuration for this section.
    #[must_use]
    pub fn to_backplane_config(&self) -> BackplaneConfig {
        BackplaneConfig {
            topic_prefix: self.topic_prefix.clone(),
            wire_format: self.wire_format,
            registry: RegistryConfig {
                max_topics: self.max_topics,
            },
            tracker: TrackerConfig {
                max_subscriptions_per_session: self.max_subscriptions_per_session,
            },
        }
    }
}

impl Config {
    /// Load configuration from the default locations and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment override has the wrong type.
    pub fn load() -> Result<Self> {
        Self::load_from(&CONFIG_PATHS)
    }

    /// Load configuration from the first existing file of `paths`, layered
    /// under `RELAY__*` environment variables.
    ///
    /// # Errors
    ///
    /// See [`Config::load`].
    pub fn load_from(paths: &[&str]) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = first_existing(paths) {
            tracing::info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(::config::File::from(path.as_path()));
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .context("Failed to assemble configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }
}

fn first_existing(paths: &[&str]) -> Option<PathBuf> {
    paths
        .iter()
        .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
        .find(|path| path.exists())
}
