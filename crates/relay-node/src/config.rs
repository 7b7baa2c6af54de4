//! # Node Configuration
//!
//! Loaded in three layers: defaults, an optional TOML file named by
//! `RELAY_CONFIG`, then individual `RELAY_*` environment overrides.
//!
//! ```toml
//! [gateway]
//! environment = "production"
//! server = { port = 8080 }
//! websocket = { ping_interval = "30s" }
//! auth = { token_secret = "…" }
//!
//! [database]
//! url = "postgres://relay@localhost/relay"
//!
//! [bus]
//! channel_prefix = "relay."
//!
//! [log]
//! filter = "info,relay_gateway=debug"
//! json = true
//! ```

use relay_bus::{BusConfig, BusConfigError};
use relay_gateway::{ConfigError, Environment, GatewayConfig};
use relay_store::{DatabaseConfig, DatabaseConfigError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CONFIG_PATH_ENV: &str = "RELAY_CONFIG";
pub const DATABASE_URL_ENV: &str = "RELAY_DATABASE_URL";
pub const PORT_ENV: &str = "RELAY_PORT";
pub const TOKEN_SECRET_ENV: &str = "RELAY_TOKEN_SECRET";
pub const ENVIRONMENT_ENV: &str = "RELAY_ENV";
pub const LOG_JSON_ENV: &str = "RELAY_LOG_JSON";

/// Complete node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub gateway: GatewayConfig,
    pub database: DatabaseConfig,
    pub bus: BusConfig,
    pub log: LogConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directives, used when `RUST_LOG` is unset.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum NodeConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid {name}: `{value}`")]
    Env { name: &'static str, value: String },
    #[error("gateway: {0}")]
    Gateway(#[from] ConfigError),
    #[error("database: {0}")]
    Database(#[from] DatabaseConfigError),
    #[error("bus: {0}")]
    Bus(#[from] BusConfigError),
}

impl NodeConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, NodeConfigError> {
        Self::load(|name| std::env::var(name).ok())
    }

    /// Load using `env` to look up variables.
    pub fn load(env: impl Fn(&str) -> Option<String>) -> Result<Self, NodeConfigError> {
        let mut config = match env(CONFIG_PATH_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env(env)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, NodeConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| NodeConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| NodeConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<(), NodeConfigError> {
        if let Some(url) = env(DATABASE_URL_ENV) {
            self.database.url = url;
        }
        if let Some(port) = env(PORT_ENV) {
            self.gateway.server.port = port.parse().map_err(|_| NodeConfigError::Env {
                name: PORT_ENV,
                value: port,
            })?;
        }
        if let Some(secret) = env(TOKEN_SECRET_ENV) {
            self.gateway.auth.token_secret = secret;
        }
        if let Some(environment) = env(ENVIRONMENT_ENV) {
            self.gateway.environment =
                environment
                    .parse::<Environment>()
                    .map_err(|_| NodeConfigError::Env {
                        name: ENVIRONMENT_ENV,
                        value: environment,
                    })?;
        }
        if let Some(json) = env(LOG_JSON_ENV) {
            self.log.json = matches!(json.as_str(), "1" | "true" | "yes");
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), NodeConfigError> {
        self.gateway.validate()?;
        self.database.validate()?;
        self.bus.validate()?;
        Ok(())
    }
}
