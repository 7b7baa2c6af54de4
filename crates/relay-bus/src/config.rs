//! Bus configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Default prefix applied to every store-level channel name.
pub const DEFAULT_CHANNEL_PREFIX: &str = "relay.";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Namespace applied to store channel names so other applications
    /// sharing the database do not collide with ours.
    pub channel_prefix: String,
    /// Delay before retrying after the listening connection fails.
    #[serde(with = "humantime_serde")]
    pub reconnect_delay: Duration,
    /// Upper bound for the doubling reconnect delay.
    #[serde(with = "humantime_serde")]
    pub max_reconnect_delay: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            channel_prefix: DEFAULT_CHANNEL_PREFIX.to_string(),
            reconnect_delay: Duration::from_millis(500),
            max_reconnect_delay: Duration::from_secs(30),
        }
    }
}

impl BusConfig {
    pub fn validate(&self) -> Result<(), BusConfigError> {
        if !self
            .channel_prefix
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'.')
        {
            return Err(BusConfigError::InvalidPrefix(self.channel_prefix.clone()));
        }
        if self.reconnect_delay.is_zero() || self.reconnect_delay > self.max_reconnect_delay {
            return Err(BusConfigError::InvalidBackoff);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Error)]
pub enum BusConfigError {
    #[error("invalid channel prefix `{0}`")]
    InvalidPrefix(String),
    #[error("reconnect_delay must be non-zero and at most max_reconnect_delay")]
    InvalidBackoff,
}
