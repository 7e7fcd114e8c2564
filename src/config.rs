//! Environment-based relay configuration.

use std::time::Duration;

use thiserror::Error;

/// Relay configuration, read from the environment at startup.
///
/// The relay keeps no file-based state; everything it needs to run comes
/// from these values.
#[derive(Debug, Clone)]
pub struct Config {
    /// Host address the WebSocket/HTTP listener binds to.
    pub host: String,
    /// Port the listener binds to.
    pub port: u16,
    /// Connection URL of the pub/sub backbone (e.g. "redis://127.0.0.1:6379").
    pub backbone_url: String,
    /// Origins allowed to open cross-origin WebSocket/HTTP requests.
    pub allowed_origins: Vec<String>,
    /// Shared secret used to verify connection credentials.
    pub jwt_secret: String,
    /// Deployment environment name ("development", "production", ...).
    pub environment: String,
    /// How often the relay pings each connection.
    pub heartbeat_interval: Duration,
    /// Idle time after which a connection is treated as disconnected.
    pub heartbeat_timeout: Duration,
    /// Window after a disconnect during which a reconnecting client
    /// resumes its prior room memberships.
    pub grace_window: Duration,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),

    #[error("invalid value for {var}: {value}")]
    InvalidVar { var: &'static str, value: String },
}

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_BACKBONE_URL: &str = "redis://127.0.0.1:6379";

impl Config {
    /// Build a configuration from the process environment.
    ///
    /// `RELAY_JWT_SECRET` is required; everything else has a development
    /// default. `ALLOWED_ORIGINS` is a comma-separated list.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = std::env::var("RELAY_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());

        let port = match std::env::var("RELAY_PORT") {
            Ok(raw) => raw.parse::<u16>().map_err(|_| ConfigError::InvalidVar {
                var: "RELAY_PORT",
                value: raw,
            })?,
            Err(_) => DEFAULT_PORT,
        };

        let backbone_url =
            std::env::var("BACKBONE_URL").unwrap_or_else(|_| DEFAULT_BACKBONE_URL.to_string());

        let allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let jwt_secret = std::env::var("RELAY_JWT_SECRET")
            .map_err(|_| ConfigError::MissingVar("RELAY_JWT_SECRET"))?;

        let environment =
            std::env::var("RELAY_ENV").unwrap_or_else(|_| "development".to_string());

        Ok(Self {
            host,
            port,
            backbone_url,
            allowed_origins,
            jwt_secret,
            environment,
            heartbeat_interval: Duration::from_secs(25),
            heartbeat_timeout: Duration::from_secs(60),
            grace_window: Duration::from_secs(120),
        })
    }
}
