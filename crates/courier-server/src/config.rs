//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (COURIER_*)
//! - TOML configuration file

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Backend connections.
    #[serde(default)]
    pub backends: BackendsConfig,

    /// Authentication configuration.
    #[serde(default)]
    pub auth: AuthConfig,

    /// TURN relay configuration for WebRTC clients.
    #[serde(default)]
    pub turn: TurnConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Backend connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendsConfig {
    /// Redis connection URL (pub/sub medium, counters, snapshot cache).
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// SQLite database path for durable call records.
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret shared with the token issuer.
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,
}

/// TURN relay configuration. Only the STUN defaults are served when no TURN
/// server is configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    /// TURN server URL (`turn:` or `turns:` scheme).
    #[serde(default = "default_turn_url")]
    pub server_url: Option<String>,

    /// TURN username, if the relay requires one.
    #[serde(default = "default_turn_username")]
    pub username: Option<String>,

    /// TURN credential, if the relay requires one.
    #[serde(default = "default_turn_password")]
    pub password: Option<String>,
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
    std::env::var("COURIER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("COURIER_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_redis_url() -> String {
    std::env::var("COURIER_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

fn default_database_path() -> String {
    std::env::var("COURIER_DATABASE_PATH").unwrap_or_else(|_| "courier.db".to_string())
}

fn default_jwt_secret() -> String {
    std::env::var("COURIER_JWT_SECRET").unwrap_or_default()
}

fn default_turn_url() -> Option<String> {
    std::env::var("COURIER_TURN_URL").ok()
}

fn default_turn_username() -> Option<String> {
    std::env::var("COURIER_TURN_USERNAME").ok()
}

fn default_turn_password() -> Option<String> {
    std::env::var("COURIER_TURN_PASSWORD").ok()
}

fn default_true() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            websocket_path: default_ws_path(),
            backends: BackendsConfig::default(),
            auth: AuthConfig::default(),
            turn: TurnConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            database_path: default_database_path(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: default_jwt_secret(),
        }
    }
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            server_url: default_turn_url(),
            username: default_turn_username(),
            password: default_turn_password(),
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

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        // Try to load from default paths
        let config_paths = [
            "courier.toml",
            "/etc/courier/courier.toml",
            "~/.config/courier/courier.toml",
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
    /// Returns an error if host and port do not form a valid address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.websocket_path, "/ws");
        assert!(config.metrics.enabled);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            ..Config::default()
        };
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 8080);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [backends]
            redis_url = "redis://cache:6379"

            [auth]
            jwt_secret = "s3cret"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.backends.redis_url, "redis://cache:6379");
        assert_eq!(config.auth.jwt_secret, "s3cret");
        // Unspecified sections fall back to defaults.
        assert_eq!(config.backends.database_path, "courier.db");
    }

    #[test]
    fn test_turn_config_from_toml() {
        let toml_str = r#"
            [turn]
            server_url = "turn:relay.example.com:3478"
            username = "courier"
            password = "hunter2"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(
            config.turn.server_url.as_deref(),
            Some("turn:relay.example.com:3478")
        );
        assert_eq!(config.turn.username.as_deref(), Some("courier"));
    }
}
