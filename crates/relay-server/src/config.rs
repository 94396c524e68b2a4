//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (RELAY_*)
//! - TOML configuration file, `RELAY_CONFIG` or one of the default paths

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tenvis_relay_core::{ConnectionConfig, TrustedCredential, DEFAULT_OUTBOX_CAPACITY};

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Gateway behaviour.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Which WebSocket stack accepts connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// axum upgrade handler, served next to `/health`.
    #[default]
    Axum,
    /// Raw tokio-tungstenite accept loop.
    Tungstenite,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub backend: Backend,

    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Gateway configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Session id of the trusted producer.
    #[serde(default = "default_trusted_session")]
    pub trusted_session: Option<String>,

    /// Pause between HELLO and READY in milliseconds.
    #[serde(default = "default_handshake_delay")]
    pub handshake_delay_ms: u64,

    /// Skip unparseable messages instead of closing the connection.
    #[serde(default)]
    pub tolerate_malformed: bool,

    /// Queued messages per connection before a slow client is dropped.
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,
}

/// Store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// JSON fixture seeding the in-memory store.
    #[serde(default)]
    pub fixture: Option<PathBuf>,
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
    std::env::var("RELAY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("RELAY_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_trusted_session() -> Option<String> {
    std::env::var("RELAY_TRUSTED_SESSION")
        .ok()
        .filter(|s| !s.is_empty())
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_handshake_delay() -> u64 {
    9_000
}

fn default_outbox_capacity() -> usize {
    DEFAULT_OUTBOX_CAPACITY
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            gateway: GatewayConfig::default(),
            store: StoreConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            websocket_path: default_ws_path(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            trusted_session: default_trusted_session(),
            handshake_delay_ms: default_handshake_delay(),
            tolerate_malformed: false,
            outbox_capacity: default_outbox_capacity(),
        }
    }
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field(
                "trusted_session",
                &self.trusted_session.as_ref().map(|_| "<redacted>"),
            )
            .field("handshake_delay_ms", &self.handshake_delay_ms)
            .field("tolerate_malformed", &self.tolerate_malformed)
            .field("outbox_capacity", &self.outbox_capacity)
            .finish()
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

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var("RELAY_CONFIG") {
            return Self::from_file(shellexpand::tilde(&path).as_ref());
        }

        // Try to load from default paths
        let config_paths = [
            "relay.toml",
            "/etc/relay/relay.toml",
            "~/.config/relay/relay.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
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
    /// Returns an error if host and port do not form an address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Per-connection settings for the gateway.
    #[must_use]
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            handshake_delay: Duration::from_millis(self.gateway.handshake_delay_ms),
            tolerate_malformed: self.gateway.tolerate_malformed,
            outbox_capacity: self.gateway.outbox_capacity,
        }
    }

    /// The trusted producer credential, disabled when none is configured.
    #[must_use]
    pub fn trusted_credential(&self) -> TrustedCredential {
        match &self.gateway.trusted_session {
            Some(secret) if !secret.is_empty() => TrustedCredential::new(secret),
            _ => TrustedCredential::disabled(),
        }
    }
}
