//! Domain types shared by the transport and the session layer.

pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;

pub use config::{
    AuthConfig, ConfigError, Environment, GatewayConfig, ServerConfig, WebSocketConfig,
    DEV_TOKEN_SECRET,
};
pub use connection::ConnectionId;
pub use error::{ApiError, ApiErrorCode, GatewayError};
pub use protocol::{ClientMessage, ErrorBody, ServerMessage, SubscriptionId};
