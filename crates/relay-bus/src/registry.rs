//! # Channel Registry
//!
//! Multiplexes one store notification connection across any number of
//! in-process listeners.
//!
//! ```text
//!                      ┌──────────────────────────────┐
//!  listen(ch, f) ────► │ ChannelRegistry              │
//!                      │   ch ─► [listener₁, ...]     │ ◄── dispatcher ◄── FeedConnection
//!  handle.unlisten ──► │   LISTEN on 0→1              │        │
//!                      │   UNLISTEN on 1→0            │        └─► per-listener queue ─► task
//!                      └──────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - The store is listening on a channel exactly while the channel has at
//!   least one listener. LISTEN runs before the first listener is added, so
//!   a failed LISTEN leaves nothing registered.
//! - Transitions are serialized by a registry-wide control lock, so
//!   concurrent `listen`/`unlisten` calls issue one LISTEN and one UNLISTEN
//!   per 0↔1 transition.
//! - Every listener has its own task and queue. A slow, failing or
//!   panicking listener never delays or breaks its siblings.
//! - Notifications on one channel reach each listener in store order.

use crate::channel::{Channel, ChannelName};
use crate::config::BusConfig;
use crate::error::BusError;
use crate::feed::{FeedConnection, Notification, NotificationFeed};
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex as AsyncMutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Type-erased listener callback.
pub type ListenerFn =
    Arc<dyn Fn(Arc<Value>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct Listener {
    id: u64,
    queue: mpsc::UnboundedSender<Arc<Value>>,
}

#[derive(Default)]
struct ChannelListeners {
    /// Whether the store has been asked to LISTEN on this channel.
    listening: bool,
    listeners: Vec<Listener>,
}

struct RegistryInner {
    feed: Arc<dyn NotificationFeed>,
    prefix: String,
    connection: OnceCell<Box<dyn FeedConnection>>,
    channels: RwLock<HashMap<ChannelName, ChannelListeners>>,
    /// Serializes LISTEN/UNLISTEN transitions.
    control: AsyncMutex<()>,
    next_listener: AtomicU64,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        if let Some(handle) = self.dispatcher.get_mut().take() {
            handle.abort();
        }
    }
}

/// Reference-counted LISTEN/UNLISTEN over a single feed connection.
///
/// Cheap to clone; clones share the same connection and listener map.
#[derive(Clone)]
pub struct ChannelRegistry {
    inner: Arc<RegistryInner>,
}

impl ChannelRegistry {
    pub fn new(feed: Arc<dyn NotificationFeed>, prefix: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                feed,
                prefix: prefix.into(),
                connection: OnceCell::new(),
                channels: RwLock::new(HashMap::new()),
                control: AsyncMutex::new(()),
                next_listener: AtomicU64::new(1),
                dispatcher: Mutex::new(None),
            }),
        }
    }

    pub fn from_config(feed: Arc<dyn NotificationFeed>, config: &BusConfig) -> Self {
        Self::new(feed, config.channel_prefix.clone())
    }

    /// Register `listener` for every notification on `channel`.
    ///
    /// The first listener on a channel opens the shared connection (if not
    /// yet open) and issues LISTEN before it is added.
    pub async fn listen<P, F, Fut>(
        &self,
        channel: &Channel<P>,
        listener: F,
    ) -> Result<ListenerHandle, BusError>
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = channel.name().clone();
        let decode_as = name.clone();
        let callback: ListenerFn = Arc::new(move |payload: Arc<Value>| {
            match Channel::<P>::decode(&decode_as, &payload) {
                Ok(payload) => listener(payload).boxed(),
                Err(err) => future::ready(Err(err.into())).boxed(),
            }
        });
        self.listen_raw(name, callback).await
    }

    /// Register an untyped listener.
    pub async fn listen_raw(
        &self,
        name: ChannelName,
        callback: ListenerFn,
    ) -> Result<ListenerHandle, BusError> {
        let connection = self.connection().await?;
        let _control = self.inner.control.lock().await;

        let listening = self
            .inner
            .channels
            .read()
            .get(&name)
            .is_some_and(|entry| entry.listening);
        if !listening {
            connection.listen(&self.store_channel(&name)).await?;
            debug!(channel = %name, "Listening to channel");
        }

        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        let (queue, deliveries) = mpsc::unbounded_channel();
        tokio::spawn(run_listener(
            name.clone(),
            id,
            deliveries,
            active.clone(),
            callback,
        ));

        {
            let mut channels = self.inner.channels.write();
            let entry = channels.entry(name.clone()).or_default();
            entry.listening = true;
            entry.listeners.push(Listener { id, queue });
        }
        trace!(channel = %name, listener_id = id, "Listener registered");

        Ok(ListenerHandle {
            registry: self.clone(),
            channel: name,
            id,
            active,
            released: false,
        })
    }

    /// Send `payload` on `channel` outside any caller's transaction.
    pub async fn notify<P: Serialize>(
        &self,
        channel: &Channel<P>,
        payload: &P,
    ) -> Result<(), BusError> {
        let text = channel.encode(payload)?;
        self.inner
            .feed
            .notify(&self.store_channel(channel.name()), &text)
            .await?;
        trace!(channel = %channel.name(), "Notification sent");
        Ok(())
    }

    /// Number of listeners currently registered on `channel`.
    pub fn listener_count(&self, channel: &ChannelName) -> usize {
        self.inner
            .channels
            .read()
            .get(channel)
            .map_or(0, |entry| entry.listeners.len())
    }

    /// Whether the store is (believed to be) listening on `channel`.
    pub fn is_listening(&self, channel: &ChannelName) -> bool {
        self.inner
            .channels
            .read()
            .get(channel)
            .is_some_and(|entry| entry.listening)
    }

    fn store_channel(&self, name: &ChannelName) -> String {
        format!("{}{}", self.inner.prefix, name)
    }

    async fn connection(&self) -> Result<&dyn FeedConnection, BusError> {
        let connection = self
            .inner
            .connection
            .get_or_try_init(|| async {
                let (connection, notifications) = self.inner.feed.connect().await?;
                let dispatcher =
                    tokio::spawn(dispatch_loop(Arc::downgrade(&self.inner), notifications));
                *self.inner.dispatcher.lock() = Some(dispatcher);
                info!(prefix = %self.inner.prefix, "Notification connection opened");
                Ok::<_, BusError>(connection)
            })
            .await?;
        Ok(connection.as_ref())
    }

    async fn unlisten(&self, name: &ChannelName, id: u64) -> Result<(), BusError> {
        let _control = self.inner.control.lock().await;

        let drained = {
            let mut channels = self.inner.channels.write();
            let Some(entry) = channels.get_mut(name) else {
                return Ok(());
            };
            let before = entry.listeners.len();
            entry.listeners.retain(|listener| listener.id != id);
            before != entry.listeners.len() && entry.listeners.is_empty()
        };
        trace!(channel = %name, listener_id = id, "Listener removed");
        if !drained {
            return Ok(());
        }

        let Some(connection) = self.inner.connection.get() else {
            return Ok(());
        };
        match connection.unlisten(&self.store_channel(name)).await {
            Ok(()) => {
                let mut channels = self.inner.channels.write();
                if channels
                    .get(name)
                    .is_some_and(|entry| entry.listeners.is_empty())
                {
                    channels.remove(name);
                }
                debug!(channel = %name, "Stopped listening to channel");
                Ok(())
            }
            Err(err) => {
                // The entry stays marked as listening with no listeners, so
                // the next listener skips LISTEN and the next 1→0
                // transition retries UNLISTEN.
                error!(channel = %name, error = %err, "UNLISTEN failed; channel left listening");
                Err(err)
            }
        }
    }
}

impl RegistryInner {
    fn dispatch(&self, notification: Notification) {
        let Some(name) = notification.channel.strip_prefix(self.prefix.as_str()) else {
            trace!(channel = %notification.channel, "Ignoring notification outside prefix");
            return;
        };

        let payload = if notification.payload.is_empty() {
            Value::Null
        } else {
            match serde_json::from_str::<Value>(&notification.payload) {
                Ok(value) => value,
                Err(err) => {
                    warn!(channel = name, error = %err, "Dropping notification with malformed payload");
                    return;
                }
            }
        };
        let payload = Arc::new(payload);

        let channels = self.channels.read();
        let Some(entry) = channels.get(name) else {
            trace!(channel = name, "No listeners for notification");
            return;
        };
        for listener in &entry.listeners {
            if listener.queue.send(payload.clone()).is_err() {
                debug!(channel = name, listener_id = listener.id, "Listener task already stopped");
            }
        }
    }
}

async fn dispatch_loop(
    registry: Weak<RegistryInner>,
    mut notifications: mpsc::UnboundedReceiver<Notification>,
) {
    while let Some(notification) = notifications.recv().await {
        let Some(inner) = registry.upgrade() else {
            break;
        };
        inner.dispatch(notification);
    }
    debug!("Notification dispatcher stopped");
}

async fn run_listener(
    channel: ChannelName,
    id: u64,
    mut deliveries: mpsc::UnboundedReceiver<Arc<Value>>,
    active: Arc<AtomicBool>,
    callback: ListenerFn,
) {
    while let Some(payload) = deliveries.recv().await {
        if !active.load(Ordering::Acquire) {
            break;
        }
        let outcome = AssertUnwindSafe(async { callback(payload).await })
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(channel = %channel, listener_id = id, error = %err, "Listener failed");
            }
            Err(_) => {
                error!(channel = %channel, listener_id = id, "Listener panicked");
            }
        }
    }
}

/// Registration returned by [`ChannelRegistry::listen`].
///
/// Call [`unlisten`](Self::unlisten) to remove the listener. A handle that is
/// dropped instead stops delivery immediately and unregisters in the
/// background.
#[must_use = "dropping a ListenerHandle unregisters the listener"]
pub struct ListenerHandle {
    registry: ChannelRegistry,
    channel: ChannelName,
    id: u64,
    active: Arc<AtomicBool>,
    released: bool,
}

impl ListenerHandle {
    pub fn channel(&self) -> &ChannelName {
        &self.channel
    }

    /// Remove the listener, issuing UNLISTEN if it was the channel's last.
    ///
    /// No delivery starts after this is called.
    pub async fn unlisten(mut self) -> Result<(), BusError> {
        self.released = true;
        self.active.store(false, Ordering::Release);
        self.registry.unlisten(&self.channel, self.id).await
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.active.store(false, Ordering::Release);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(channel = %self.channel, listener_id = self.id, "Listener dropped outside a runtime");
            return;
        };
        debug!(channel = %self.channel, listener_id = self.id, "Listener dropped without unlisten");
        let registry = self.registry.clone();
        let channel = self.channel.clone();
        let id = self.id;
        runtime.spawn(async move {
            if let Err(err) = registry.unlisten(&channel, id).await {
                warn!(channel = %channel, listener_id = id, error = %err, "Background unlisten failed");
            }
        });
    }
}
