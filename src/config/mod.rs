//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables (`LIME_*`)
//! - CLI arguments (for the `lime` binary)
//!
//! Durations are given in milliseconds.
//!
//! ```toml
//! [channel]
//! identity = "client@limeprotocol.org"
//! instance = "home"
//! send_timeout_ms = 60000
//! remote_ping_interval_ms = 30000
//! remote_idle_timeout_ms = 120000
//!
//! [channel.authentication]
//! scheme = "plain"
//! password = "secret"
//!
//! [multiplexer]
//! count = 5
//!
//! [listener]
//! uri = "net.tcp://0.0.0.0:55321"
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::{
    ChannelSettings, EstablishedChannelBuilder, DEFAULT_ENVELOPE_BUFFER_SIZE,
    DEFAULT_INPUT_BUFFER_SIZE, DEFAULT_OUTPUT_BUFFER_SIZE, DEFAULT_SEND_TIMEOUT,
};
use crate::error::{LimeError, Result};
use crate::protocol::{Authentication, Identity, SessionCompression, SessionEncryption};
use crate::transport::{TransportFactory, DEFAULT_TCP_PORT};

/// Main configuration struct
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Client channel configuration
    #[serde(default)]
    pub channel: ChannelConfig,

    /// Multiplexer configuration
    #[serde(default)]
    pub multiplexer: MultiplexerConfig,

    /// Listener configuration
    #[serde(default)]
    pub listener: ListenerConfig,
}

impl Config {
    /// Default config file location (`<config dir>/lime/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("lime").join("config.toml"))
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            LimeError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| LimeError::Config(format!("Failed to parse config: {e}")))
    }

    /// Load the default file if it exists, then apply environment overrides
    pub fn load() -> Result<Self> {
        let config = match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(path)?,
            _ => Self::default(),
        };
        config.with_env()
    }

    /// Defaults with environment overrides
    pub fn from_env() -> Result<Self> {
        Self::default().with_env()
    }

    /// Apply `LIME_*` environment variables on top of this configuration
    pub fn with_env(self) -> Result<Self> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(identity) = var("LIME_IDENTITY") {
            self.channel.identity = Identity::parse(&identity)?;
        }
        if let Some(instance) = var("LIME_INSTANCE") {
            self.channel.instance = Some(instance);
        }
        if let Some(password) = var("LIME_PASSWORD") {
            self.channel.authentication = Authentication::Plain { password };
        }
        if let Some(value) = var("LIME_SEND_TIMEOUT_MS") {
            self.channel.send_timeout_ms = parse_number("LIME_SEND_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = var("LIME_REMOTE_PING_INTERVAL_MS") {
            self.channel.remote_ping_interval_ms =
                Some(parse_number("LIME_REMOTE_PING_INTERVAL_MS", &value)?);
        }
        if let Some(value) = var("LIME_REMOTE_IDLE_TIMEOUT_MS") {
            self.channel.remote_idle_timeout_ms =
                Some(parse_number("LIME_REMOTE_IDLE_TIMEOUT_MS", &value)?);
        }
        if let Some(value) = var("LIME_CHANNEL_COUNT") {
            self.multiplexer.count = parse_number("LIME_CHANNEL_COUNT", &value)?;
        }
        if let Some(uri) = var("LIME_LISTENER_URI") {
            self.listener.uri = uri;
        }
        Ok(self)
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| LimeError::Config(format!("{name} must be a number, got '{value}'")))
}

/// Client channel configuration.
///
/// This is the configuration set consumed by [`EstablishedChannelBuilder`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Identity presented to the server
    pub identity: Identity,

    /// Instance of the local node
    pub instance: Option<String>,

    /// Credentials
    pub authentication: Authentication,

    /// Preferred compression
    pub compression: SessionCompression,

    /// Preferred encryption
    pub encryption: SessionEncryption,

    /// Timeout of a single send
    pub send_timeout_ms: u64,

    /// Interval of the idle check
    pub remote_ping_interval_ms: Option<u64>,

    /// Inactivity after which the channel finishes itself
    pub remote_idle_timeout_ms: Option<u64>,

    /// Capacity of each inbound queue
    pub envelope_buffer_size: usize,

    /// Answer ping requests automatically
    pub auto_reply_pings: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            identity: Identity::new("guest", "localhost"),
            instance: None,
            authentication: Authentication::Guest,
            compression: SessionCompression::None,
            encryption: SessionEncryption::None,
            send_timeout_ms: DEFAULT_SEND_TIMEOUT.as_millis() as u64,
            remote_ping_interval_ms: None,
            remote_idle_timeout_ms: None,
            envelope_buffer_size: DEFAULT_ENVELOPE_BUFFER_SIZE,
            auto_reply_pings: true,
        }
    }
}

impl ChannelConfig {
    /// Channel settings described by this configuration
    pub fn to_settings(&self) -> ChannelSettings {
        ChannelSettings {
            send_timeout: Duration::from_millis(self.send_timeout_ms),
            envelope_buffer_size: self.envelope_buffer_size.max(1),
            remote_ping_interval: self.remote_ping_interval_ms.map(Duration::from_millis),
            remote_idle_timeout: self.remote_idle_timeout_ms.map(Duration::from_millis),
        }
    }

    /// Channel builder over `transport_factory` with these settings
    pub fn builder(&self, transport_factory: Arc<dyn TransportFactory>) -> EstablishedChannelBuilder {
        let mut builder = EstablishedChannelBuilder::new(transport_factory, self.identity.clone())
            .with_authentication(self.authentication.clone())
            .with_compression(self.compression)
            .with_encryption(self.encryption)
            .with_settings(self.to_settings())
            .with_auto_reply_pings(self.auto_reply_pings);
        if let Some(instance) = &self.instance {
            builder = builder.with_instance(instance.clone());
        }
        builder
    }
}

/// Multiplexer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiplexerConfig {
    /// Number of underlying channels
    pub count: usize,

    /// Capacity of the merged inbound queues
    pub input_buffer_size: usize,

    /// Capacity of the outbound queue
    pub output_buffer_size: usize,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            count: 5,
            input_buffer_size: DEFAULT_INPUT_BUFFER_SIZE,
            output_buffer_size: DEFAULT_OUTPUT_BUFFER_SIZE,
        }
    }
}

/// Listener configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Listen URI (`net.tcp://host:port`)
    pub uri: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            uri: format!("net.tcp://localhost:{DEFAULT_TCP_PORT}"),
        }
    }
}
