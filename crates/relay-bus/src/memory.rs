//! In-memory notification feed.
//!
//! Behaves like a single-node LISTEN/NOTIFY: notifications reach the open
//! connection only for channels it is listening on. Every LISTEN, UNLISTEN
//! and connect is counted so tests can assert on the exact commands issued.

use crate::error::BusError;
use crate::feed::{FeedConnection, Notification, NotificationFeed};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Default)]
struct FeedState {
    connects: AtomicUsize,
    listening: Mutex<HashSet<String>>,
    listen_calls: Mutex<HashMap<String, usize>>,
    unlisten_calls: Mutex<HashMap<String, usize>>,
    sent: Mutex<Vec<Notification>>,
    receiver: Mutex<Option<mpsc::UnboundedSender<Notification>>>,
    fail_listen: AtomicBool,
    fail_unlisten: AtomicBool,
    command_delay: Mutex<Option<Duration>>,
}

/// Feed that keeps everything in process.
#[derive(Clone, Default)]
pub struct InMemoryFeed {
    state: Arc<FeedState>,
}

impl InMemoryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// LISTEN commands issued for `channel`, including failed ones.
    pub fn listen_calls(&self, channel: &str) -> usize {
        self.state
            .listen_calls
            .lock()
            .get(channel)
            .copied()
            .unwrap_or(0)
    }

    /// UNLISTEN commands issued for `channel`, including failed ones.
    pub fn unlisten_calls(&self, channel: &str) -> usize {
        self.state
            .unlisten_calls
            .lock()
            .get(channel)
            .copied()
            .unwrap_or(0)
    }

    pub fn is_listening(&self, channel: &str) -> bool {
        self.state.listening.lock().contains(channel)
    }

    /// Every notification sent through [`NotificationFeed::notify`].
    pub fn sent(&self) -> Vec<Notification> {
        self.state.sent.lock().clone()
    }

    /// Make the next LISTEN fail.
    pub fn fail_next_listen(&self) {
        self.state.fail_listen.store(true, Ordering::SeqCst);
    }

    /// Make the next UNLISTEN fail.
    pub fn fail_next_unlisten(&self) {
        self.state.fail_unlisten.store(true, Ordering::SeqCst);
    }

    /// Delay every LISTEN/UNLISTEN, widening race windows.
    pub fn set_command_delay(&self, delay: Duration) {
        *self.state.command_delay.lock() = Some(delay);
    }

    /// Push a raw notification to the open connection, bypassing the
    /// listening check.
    pub fn deliver(&self, channel: &str, payload: &str) {
        if let Some(receiver) = self.state.receiver.lock().as_ref() {
            let _ = receiver.send(Notification {
                channel: channel.to_owned(),
                payload: payload.to_owned(),
            });
        }
    }
}

#[async_trait]
impl NotificationFeed for InMemoryFeed {
    async fn connect(
        &self,
    ) -> Result<(Box<dyn FeedConnection>, mpsc::UnboundedReceiver<Notification>), BusError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = mpsc::unbounded_channel();
        *self.state.receiver.lock() = Some(sender);
        Ok((
            Box::new(InMemoryConnection {
                state: self.state.clone(),
            }),
            receiver,
        ))
    }

    async fn notify(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        let notification = Notification {
            channel: channel.to_owned(),
            payload: payload.to_owned(),
        };
        self.state.sent.lock().push(notification.clone());
        if self.state.listening.lock().contains(channel) {
            if let Some(receiver) = self.state.receiver.lock().as_ref() {
                let _ = receiver.send(notification);
            }
        }
        Ok(())
    }
}

struct InMemoryConnection {
    state: Arc<FeedState>,
}

impl InMemoryConnection {
    async fn pause(&self) {
        let delay = *self.state.command_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl FeedConnection for InMemoryConnection {
    async fn listen(&self, channel: &str) -> Result<(), BusError> {
        *self
            .state
            .listen_calls
            .lock()
            .entry(channel.to_owned())
            .or_default() += 1;
        self.pause().await;
        if self.state.fail_listen.swap(false, Ordering::SeqCst) {
            return Err(BusError::Command {
                command: "LISTEN",
                channel: channel.to_owned(),
                reason: "injected failure".into(),
            });
        }
        self.state.listening.lock().insert(channel.to_owned());
        Ok(())
    }

    async fn unlisten(&self, channel: &str) -> Result<(), BusError> {
        *self
            .state
            .unlisten_calls
            .lock()
            .entry(channel.to_owned())
            .or_default() += 1;
        self.pause().await;
        if self.state.fail_unlisten.swap(false, Ordering::SeqCst) {
            return Err(BusError::Command {
                command: "UNLISTEN",
                channel: channel.to_owned(),
                reason: "injected failure".into(),
            });
        }
        self.state.listening.lock().remove(channel);
        Ok(())
    }
}
