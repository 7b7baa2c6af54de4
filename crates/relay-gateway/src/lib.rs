//! # Relay Gateway - WebSocket Subscription Sessions
//!
//! Accepts authenticated WebSocket connections and lets clients subscribe to
//! live domain events over a small JSON protocol.
//!
//! ```text
//! ┌──────────┐  GET /?access_token=…  ┌────────────┐   frames   ┌──────────┐
//! │  Client  │ ─────────────────────► │  AuthLayer │ ─────────► │ Session  │
//! └──────────┘ ◄───────────────────── └────────────┘            └────┬─────┘
//!               message / error / ping                               │ subscribe
//!                                                                    ▼
//!                           ┌────────────────┐   listen    ┌──────────────────┐
//!                           │ ChannelRegistry│ ◄────────── │ Domain handler   │
//!                           └────────────────┘             │ (step-up reads)  │
//!                                                          └──────────────────┘
//! ```
//!
//! - [`ws::session`]: per-connection id → subscription map
//! - [`ws::liveness`]: two missed pings terminate a connection
//! - [`handlers`]: domain subscriptions (`/comment/watchPostComments`)
//! - [`service`]: axum router, `/health`, graceful shutdown
//!
//! # Usage
//!
//! ```ignore
//! let registry = ChannelRegistry::from_config(feed, &bus_config);
//! let router = relay_gateway::handlers::routes(&registry)?;
//! let verifier = Arc::new(HmacTokenVerifier::new(&config.auth.token_secret));
//! GatewayService::new(config, database, router, verifier)?
//!     .start(shutdown_signal())
//!     .await?;
//! ```

#![warn(clippy::all)]
#![deny(unsafe_code)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod domain;
pub mod handlers;
pub mod middleware;
pub mod service;
pub mod ws;

pub use domain::{
    ApiError, ApiErrorCode, ClientMessage, ConfigError, ConnectionId, Environment, GatewayConfig,
    GatewayError, ServerMessage, SubscriptionId,
};
pub use middleware::{GatewayMetrics, HmacTokenVerifier, MetricsSnapshot, TokenVerifier};
pub use service::GatewayService;
pub use ws::{
    LivenessMonitor, Session, SessionConfig, SessionManager, SubscriptionHandler,
    SubscriptionRouter, TickReport, Unsubscribe,
};
