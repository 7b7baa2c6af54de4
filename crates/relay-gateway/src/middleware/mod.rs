//! HTTP middleware for the gateway.
//!
//! Layer order: Request → Trace → Auth (upgrade route only) → Handler

pub mod auth;
pub mod metrics;

pub use auth::{AuthError, AuthLayer, HmacTokenVerifier, TokenVerifier, ACCESS_TOKEN_PARAM};
pub use metrics::{GatewayMetrics, MetricsSnapshot};
