//! Database configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Transaction-local setting that carries the authorized account id.
pub const DEFAULT_ACCOUNT_SETTING: &str = "relay.account_id";

/// Connection pool and session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Postgres connection string.
    pub url: String,
    /// Maximum pooled connections (the notification listener holds one more).
    pub max_connections: u32,
    /// How long to wait for a free pooled connection.
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
    /// `search_path` applied to every new connection.
    pub search_path: Option<String>,
    /// Name of the setting row-level security policies read the account from.
    pub account_setting: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/relay".to_string(),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
            search_path: None,
            account_setting: DEFAULT_ACCOUNT_SETTING.to_string(),
        }
    }
}

impl DatabaseConfig {
    pub fn validate(&self) -> Result<(), DatabaseConfigError> {
        if self.url.trim().is_empty() {
            return Err(DatabaseConfigError::MissingUrl);
        }
        if self.max_connections == 0 {
            return Err(DatabaseConfigError::Invalid(
                "max_connections cannot be 0".into(),
            ));
        }
        if self.acquire_timeout.is_zero() {
            return Err(DatabaseConfigError::Invalid(
                "acquire_timeout cannot be 0".into(),
            ));
        }
        // Custom settings must be namespaced: `<prefix>.<name>`.
        if !is_qualified_setting(&self.account_setting) {
            return Err(DatabaseConfigError::Invalid(format!(
                "account_setting `{}` must look like `prefix.name`",
                self.account_setting
            )));
        }
        if let Some(path) = &self.search_path {
            let valid = path
                .split(',')
                .map(str::trim)
                .all(|schema| !schema.is_empty() && is_identifier(schema));
            if !valid {
                return Err(DatabaseConfigError::Invalid(format!(
                    "search_path `{path}` must be a comma-separated list of identifiers"
                )));
            }
        }
        Ok(())
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn is_qualified_setting(s: &str) -> bool {
    match s.split_once('.') {
        Some((prefix, name)) => is_identifier(prefix) && is_identifier(name),
        None => false,
    }
}

/// Database configuration errors.
#[derive(Debug, Clone, Error)]
pub enum DatabaseConfigError {
    #[error("database url is not configured")]
    MissingUrl,
    #[error("invalid database configuration: {0}")]
    Invalid(String),
}
