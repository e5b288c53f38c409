//! Client configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (PARLEY_SERVER_URL, PARLEY_USER_EMAIL)
//! - TOML configuration file
//! - Command line arguments, which override both

use anyhow::{bail, Context, Result};
use parley_core::{ControllerConfig, RetryPolicy};
use parley_transport::WebSocketConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the HTTP API.
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Event stream endpoint. Derived from `server_url` when absent.
    #[serde(default)]
    pub ws_url: Option<String>,

    /// Identity attached to every request.
    #[serde(default = "default_user_email")]
    pub user_email: String,

    /// History configuration.
    #[serde(default)]
    pub history: HistoryConfig,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Manual reconnect configuration.
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// History configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Messages fetched when a channel is activated.
    #[serde(default = "default_history_limit")]
    pub limit: usize,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// WebSocket handshake timeout in milliseconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Maximum size of one inbound frame in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Manual reconnect configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Attempts per `/retry`, the first one included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt in milliseconds.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Upper bound on the delay in milliseconds.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Serve Prometheus metrics.
    #[serde(default)]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_server_url() -> String {
    std::env::var("PARLEY_SERVER_URL").unwrap_or_else(|_| "http://localhost:3000".to_string())
}

fn default_user_email() -> String {
    std::env::var("PARLEY_USER_EMAIL").unwrap_or_default()
}

fn default_history_limit() -> usize {
    parley_protocol::api::DEFAULT_HISTORY_LIMIT
}

fn default_connect_timeout() -> u64 {
    10_000 // 10 seconds
}

fn default_max_message_size() -> usize {
    parley_protocol::codec::DEFAULT_MAX_FRAME_SIZE
}

fn default_max_attempts() -> u32 {
    1
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    10_000
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            ws_url: None,
            user_email: default_user_email(),
            history: HistoryConfig::default(),
            transport: TransportConfig::default(),
            reconnect: ReconnectConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            limit: default_history_limit(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, the first default path that exists,
    /// or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }

        let config_paths = [
            "parley.toml",
            "/etc/parley/parley.toml",
            "~/.config/parley/parley.toml",
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

    /// Check that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns an error if no identity is configured or a limit is zero.
    pub fn validate(&self) -> Result<()> {
        if self.user_email.trim().is_empty() {
            bail!("No user identity configured; pass --email or set PARLEY_USER_EMAIL");
        }
        if self.history.limit == 0 {
            bail!("history.limit must be at least 1");
        }
        if self.reconnect.max_attempts == 0 {
            bail!("reconnect.max_attempts must be at least 1");
        }
        Ok(())
    }

    /// WebSocket transport settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream endpoint cannot be derived.
    pub fn websocket(&self) -> Result<WebSocketConfig> {
        let mut ws = match &self.ws_url {
            Some(endpoint) => WebSocketConfig {
                endpoint: endpoint.clone(),
                ..Default::default()
            },
            None => WebSocketConfig::from_server_url(&self.server_url)
                .with_context(|| format!("Cannot derive stream URL from {}", self.server_url))?,
        };
        ws.connect_timeout = Duration::from_millis(self.transport.connect_timeout_ms);
        Ok(ws)
    }

    /// Controller settings.
    #[must_use]
    pub fn controller(&self) -> ControllerConfig {
        ControllerConfig {
            user_email: self.user_email.clone(),
            history_limit: self.history.limit,
            max_frame_size: self.transport.max_message_size,
            retry: RetryPolicy {
                max_attempts: self.reconnect.max_attempts,
                initial_backoff: Duration::from_millis(self.reconnect.initial_backoff_ms),
                max_backoff: Duration::from_millis(self.reconnect.max_backoff_ms),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.history.limit, 50);
        assert_eq!(config.transport.connect_timeout_ms, 10_000);
        assert_eq!(config.reconnect.max_attempts, 1);
        assert!(!config.metrics.enabled);
        assert!(config.ws_url.is_none());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            server_url = "https://chat.example.com"
            user_email = "ada@example.com"

            [history]
            limit = 20

            [reconnect]
            max_attempts = 4
            initial_backoff_ms = 250
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server_url, "https://chat.example.com");
        assert_eq!(config.history.limit, 20);
        assert_eq!(config.reconnect.max_attempts, 4);
        assert_eq!(config.reconnect.max_backoff_ms, 10_000);
        config.validate().unwrap();

        let controller = config.controller();
        assert_eq!(controller.user_email, "ada@example.com");
        assert_eq!(controller.history_limit, 20);
        assert_eq!(controller.retry.initial_backoff, Duration::from_millis(250));
    }

    #[test]
    fn test_websocket_endpoint_is_derived() {
        let config: Config =
            toml::from_str(r#"server_url = "https://chat.example.com/app""#).unwrap();
        let ws = config.websocket().unwrap();
        assert_eq!(ws.endpoint, "wss://chat.example.com/api/v1/ws");
        assert_eq!(ws.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_websocket_endpoint_override() {
        let config: Config = toml::from_str(
            r#"
            server_url = "http://localhost:3000"
            ws_url = "ws://stream.local:4000/api/v1/ws"

            [transport]
            connect_timeout_ms = 2500
            "#,
        )
        .unwrap();
        let ws = config.websocket().unwrap();
        assert_eq!(ws.endpoint, "ws://stream.local:4000/api/v1/ws");
        assert_eq!(ws.connect_timeout, Duration::from_millis(2500));
    }

    #[test]
    fn test_validate_requires_identity() {
        let mut config: Config = toml::from_str(r#"user_email = "ada@example.com""#).unwrap();
        config.validate().unwrap();

        config.user_email = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_reports_path() {
        let err = Config::from_file("/nonexistent/parley.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/parley.toml"));
    }
}
