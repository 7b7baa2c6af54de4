//! # Relay Bus - Notification Channel Registry
//!
//! Fans store notifications out to in-process listeners over a single
//! dedicated connection.
//!
//! ```text
//! ┌──────────────┐   notify()   ┌──────────────┐   NOTIFY    ┌──────────────┐
//! │  Writer      │ ───────────► │  Registry    │ ──────────► │  Postgres    │
//! └──────────────┘              │              │ ◄────────── │  LISTEN conn │
//! ┌──────────────┐   listen()   │              │  dispatch   └──────────────┘
//! │  Subscriber  │ ◄─────────── │              │
//! └──────────────┘              └──────────────┘
//! ```
//!
//! `notify` runs on the pool, never inside a caller's transaction; writers
//! register it as an after-commit hook so subscribers only hear about rows
//! they can already read.

#![allow(clippy::missing_const_for_fn)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod channel;
pub mod config;
pub mod error;
pub mod feed;
pub mod memory;
pub mod postgres;
pub mod registry;

pub use channel::{Channel, ChannelName, MAX_CHANNEL_NAME_LEN};
pub use config::{BusConfig, BusConfigError, DEFAULT_CHANNEL_PREFIX};
pub use error::BusError;
pub use feed::{FeedConnection, Notification, NotificationFeed};
pub use memory::InMemoryFeed;
pub use postgres::PgNotificationFeed;
pub use registry::{ChannelRegistry, ListenerFn, ListenerHandle};
