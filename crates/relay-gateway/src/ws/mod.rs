//! WebSocket subscription transport.
//!
//! - [`router`]: path → domain handler
//! - [`session`]: per-connection subscription map and frame processing
//! - [`liveness`]: two-phase ping/pong monitor
//! - [`handler`]: axum socket adapter

pub mod handler;
pub mod liveness;
pub mod router;
pub mod session;

pub use handler::WebSocketHandler;
pub use liveness::{LivenessGuard, LivenessMonitor, TickReport};
pub use router::{PreparedSubscription, SubscriptionHandler, SubscriptionRouter, Unsubscribe};
pub use session::{
    InboundFrame, Outbound, OutboundSender, Session, SessionConfig, SessionManager,
};
