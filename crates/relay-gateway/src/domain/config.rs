//! Gateway configuration with validation.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Token secret used when none is configured. Refused in production.
pub const DEV_TOKEN_SECRET: &str = "relay-development-secret";

/// Minimum accepted token secret length in bytes.
pub const MIN_TOKEN_SECRET_LEN: usize = 16;

/// Deployment environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Test,
    Production,
}

impl Environment {
    /// Whether error frames carry server-side detail.
    pub fn exposes_server_stack(&self) -> bool {
        !matches!(self, Self::Production)
    }
}

impl std::str::FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "test" => Ok(Self::Test),
            "production" | "prod" => Ok(Self::Production),
            other => Err(ConfigError::Invalid(format!("unknown environment `{other}`"))),
        }
    }
}

/// Main gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub environment: Environment,
    pub server: ServerConfig,
    pub websocket: WebSocketConfig,
    pub auth: AuthConfig,
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.websocket.ping_interval.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "ping_interval cannot be 0".into(),
            ));
        }
        if self.websocket.max_frame_size == 0 {
            return Err(ConfigError::InvalidLimit(
                "max_frame_size cannot be 0".into(),
            ));
        }
        if self.websocket.max_subscriptions_per_connection == 0 {
            return Err(ConfigError::InvalidLimit(
                "max_subscriptions_per_connection cannot be 0".into(),
            ));
        }
        if self.websocket.outbound_queue_capacity == 0 {
            return Err(ConfigError::InvalidLimit(
                "outbound_queue_capacity cannot be 0".into(),
            ));
        }
        if self.auth.token_secret.len() < MIN_TOKEN_SECRET_LEN {
            return Err(ConfigError::WeakSecret);
        }
        if self.environment == Environment::Production && self.auth.token_secret == DEV_TOKEN_SECRET
        {
            return Err(ConfigError::DevSecretInProduction);
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.server.host, self.server.port)
    }
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: IpAddr,
    /// Port (default: 8080)
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            port: 8080,
        }
    }
}

/// WebSocket session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Liveness probe interval
    #[serde(with = "humantime_serde")]
    pub ping_interval: Duration,
    /// Largest text frame accepted by a session, in bytes
    pub max_frame_size: usize,
    /// Max subscriptions per connection
    pub max_subscriptions_per_connection: usize,
    /// Frames buffered for a connection's writer before it is terminated
    pub outbound_queue_capacity: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            max_frame_size: 64 * 1024,
            max_subscriptions_per_connection: 100,
            outbound_queue_capacity: 1024,
        }
    }
}

/// Access token configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HMAC key for access tokens
    pub token_secret: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_secret: DEV_TOKEN_SECRET.to_string(),
        }
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("token_secret", &"<redacted>")
            .finish()
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid limit: {0}")]
    InvalidLimit(String),
    #[error("invalid timeout: {0}")]
    InvalidTimeout(String),
    #[error("token secret must be at least {} bytes", MIN_TOKEN_SECRET_LEN)]
    WeakSecret,
    #[error("the development token secret cannot be used in production")]
    DevSecretInProduction,
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
