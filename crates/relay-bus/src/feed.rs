//! # Notification Feed Port
//!
//! Boundary between the registry and the backing store's notification
//! mechanism. The registry opens exactly one [`FeedConnection`] and issues
//! LISTEN/UNLISTEN on it; notifications arrive on the paired receiver.
//! Sending is separate and does not touch the listening connection.

use crate::error::BusError;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// A notification as delivered by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Full store-level channel name, prefix included.
    pub channel: String,
    /// Raw payload text.
    pub payload: String,
}

/// Store-side notification mechanism.
#[async_trait]
pub trait NotificationFeed: Send + Sync {
    /// Open the dedicated receiving connection.
    async fn connect(
        &self,
    ) -> Result<(Box<dyn FeedConnection>, mpsc::UnboundedReceiver<Notification>), BusError>;

    /// Send a notification outside any caller's transaction.
    async fn notify(&self, channel: &str, payload: &str) -> Result<(), BusError>;
}

/// The long-lived receiving connection.
#[async_trait]
pub trait FeedConnection: Send + Sync {
    /// Start receiving notifications on `channel`.
    async fn listen(&self, channel: &str) -> Result<(), BusError>;

    /// Stop receiving notifications on `channel`.
    async fn unlisten(&self, channel: &str) -> Result<(), BusError>;
}
