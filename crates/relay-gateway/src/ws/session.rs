//! Per-connection subscription session.
//!
//! A [`Session`] owns the id → subscription map of one connection. It is
//! transport-agnostic: inbound frames come in through
//! [`Session::handle_frame`], outbound frames leave through an
//! [`OutboundSender`].
//!
//! Every check-and-insert on the map happens under one synchronous lock, so
//! two `subscribe` frames for the same id resolve in arrival order. Handlers
//! run on their own tasks; a connection close never cancels a registration
//! midway, it waits for it and then tears it down.

use crate::domain::config::GatewayConfig;
use crate::domain::connection::ConnectionId;
use crate::domain::error::{ApiError, ApiErrorCode};
use crate::domain::protocol::{ClientMessage, ServerMessage, SubscriptionId};
use crate::middleware::metrics::GatewayMetrics;
use crate::ws::router::{SubscriptionRouter, Unsubscribe};
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use relay_store::{AccountId, Database, Publish, SubscriptionContext};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Frame queued for the connection's writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Ping,
}

/// Queue into the connection's writer task, plus the connection's kill switch.
///
/// The queue is bounded. A peer that stops reading fills it, and the next
/// frame that does not fit terminates the connection. Termination bypasses
/// the queue, so it takes effect even while the writer is blocked.
#[derive(Debug, Clone)]
pub struct OutboundSender {
    tx: mpsc::Sender<Outbound>,
    terminated: CancellationToken,
}

impl OutboundSender {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                terminated: CancellationToken::new(),
            },
            rx,
        )
    }

    /// Queue `message`. Returns `false` if it was not queued.
    pub fn send_message(&self, message: &ServerMessage) -> bool {
        match serde_json::to_string(message) {
            Ok(text) => self.enqueue(Outbound::Text(text)),
            Err(err) => {
                error!(error = %err, "Failed to serialize server message");
                false
            }
        }
    }

    pub fn ping(&self) -> bool {
        self.enqueue(Outbound::Ping)
    }

    /// Close the connection without waiting for queued frames.
    pub fn terminate(&self) {
        self.terminated.cancel();
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.is_cancelled()
    }

    /// Resolves once [`terminate`](Self::terminate) has been called.
    pub async fn terminated(&self) {
        self.terminated.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn enqueue(&self, frame: Outbound) -> bool {
        if self.is_terminated() {
            return false;
        }
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    capacity = self.tx.max_capacity(),
                    "Outbound queue full, terminating connection"
                );
                self.terminate();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Data frame received from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// Limits applied by every session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_frame_size: usize,
    pub max_subscriptions: usize,
    /// Capacity of each connection's outbound queue.
    pub outbound_capacity: usize,
    /// Attach error detail (`serverStack`) to error frames.
    pub expose_server_stack: bool,
}

impl SessionConfig {
    pub fn from_gateway(config: &GatewayConfig) -> Self {
        Self {
            max_frame_size: config.websocket.max_frame_size,
            max_subscriptions: config.websocket.max_subscriptions_per_connection,
            outbound_capacity: config.websocket.outbound_queue_capacity,
            expose_server_stack: config.environment.exposes_server_stack(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_gateway(&GatewayConfig::default())
    }
}

/// Opens sessions that share one router, database and metrics set.
#[derive(Clone)]
pub struct SessionManager {
    router: Arc<SubscriptionRouter>,
    database: Database,
    config: SessionConfig,
    metrics: Arc<GatewayMetrics>,
}

impl SessionManager {
    pub fn new(
        router: SubscriptionRouter,
        database: Database,
        config: SessionConfig,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            router: Arc::new(router),
            database,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Start a session for an authenticated connection.
    pub fn open(&self, account: AccountId, outbound: OutboundSender) -> Session {
        let connection_id = ConnectionId::new();
        info!(%connection_id, %account, "Session opened");
        Session {
            inner: Arc::new(SessionInner {
                connection_id,
                account,
                outbound,
                manager: self.clone(),
                state: Mutex::new(SessionState::default()),
            }),
        }
    }
}

/// Map entry for one subscription id.
struct Slot {
    /// Resolves once the handler has finished registering.
    pending: oneshot::Receiver<Unsubscribe>,
    /// Cleared on unsubscribe; gates the subscription's publisher.
    active: Arc<AtomicBool>,
}

#[derive(Default)]
struct SessionState {
    closed: bool,
    subscriptions: HashMap<SubscriptionId, Slot>,
}

struct SessionInner {
    connection_id: ConnectionId,
    account: AccountId,
    outbound: OutboundSender,
    manager: SessionManager,
    state: Mutex<SessionState>,
}

/// Subscription state of one connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn connection_id(&self) -> ConnectionId {
        self.inner.connection_id
    }

    pub fn account_id(&self) -> AccountId {
        self.inner.account
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.state.lock().subscriptions.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Process one client frame.
    ///
    /// Validation and reservation complete before this returns. The returned
    /// task, if any, finishes the asynchronous part (handler registration or
    /// teardown).
    pub fn handle_frame(&self, frame: InboundFrame) -> Option<JoinHandle<()>> {
        let text = match frame {
            InboundFrame::Text(text) => text,
            InboundFrame::Binary(data) => {
                self.send_error(
                    None,
                    &ApiError::bad_input(format!("binary frames are not accepted ({} bytes)", data.len())),
                );
                return None;
            }
        };

        let max = self.inner.manager.config.max_frame_size;
        if text.len() > max {
            self.send_error(
                None,
                &ApiError::bad_input(format!("frame of {} bytes exceeds the {max} byte limit", text.len())),
            );
            return None;
        }

        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Subscribe { id, path, input }) => self.subscribe(id, path, input),
            Ok(ClientMessage::Unsubscribe { id }) => self.unsubscribe(id),
            Err(err) => {
                self.send_error(None, &ApiError::from(err));
                None
            }
        }
    }

    fn subscribe(&self, id: SubscriptionId, path: String, input: Value) -> Option<JoinHandle<()>> {
        let manager = &self.inner.manager;
        let (tx, rx) = oneshot::channel();
        let active = Arc::new(AtomicBool::new(true));

        let reserved = {
            let mut state = self.inner.state.lock();
            if state.closed {
                debug!(connection_id = %self.inner.connection_id, subscription_id = %id, "Subscribe after close ignored");
                return None;
            }
            if state.subscriptions.contains_key(&id) {
                Err(ApiError::already_exists(format!("subscription `{id}` already exists")))
            } else {
                manager.router.prepare(&path, input).and_then(|prepared| {
                    if state.subscriptions.len() >= manager.config.max_subscriptions {
                        return Err(ApiError::bad_input(format!(
                            "connection already holds {} subscriptions",
                            manager.config.max_subscriptions
                        )));
                    }
                    state.subscriptions.insert(
                        id.clone(),
                        Slot {
                            pending: rx,
                            active: Arc::clone(&active),
                        },
                    );
                    Ok(prepared)
                })
            }
        };

        let prepared = match reserved {
            Ok(prepared) => prepared,
            Err(err) => {
                manager.metrics.record_subscribe_error();
                self.send_error(Some(&id), &err);
                return None;
            }
        };

        manager.metrics.record_subscribe();
        debug!(connection_id = %self.inner.connection_id, subscription_id = %id, %path, "Subscription reserved");

        let publisher = Arc::new(SubscriptionPublisher {
            id: id.clone(),
            active: Arc::clone(&active),
            outbound: self.inner.outbound.clone(),
            metrics: Arc::clone(&manager.metrics),
        });
        let ctx = SubscriptionContext::new(self.inner.account, manager.database.clone(), publisher);
        let session = self.clone();

        Some(tokio::spawn(async move {
            let outcome = AssertUnwindSafe(prepared.invoke(ctx))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(ApiError::unknown("subscription handler panicked")));

            match outcome {
                Ok(unsubscribe) => {
                    if let Err(unsubscribe) = tx.send(unsubscribe) {
                        // The slot is gone without anyone waiting on it.
                        warn!(subscription_id = %id, "Subscription orphaned during registration");
                        if let Err(err) = unsubscribe.run().await {
                            warn!(subscription_id = %id, error = %err, "Orphaned unsubscribe failed");
                        }
                        return;
                    }
                    if active.load(Ordering::Acquire) {
                        session
                            .inner
                            .outbound
                            .send_message(&ServerMessage::Subscribed { id: id.clone() });
                        trace!(subscription_id = %id, "Subscription registered");
                    }
                }
                Err(err) => {
                    let _ = tx.send(Unsubscribe::noop());
                    session.inner.manager.metrics.record_subscribe_error();
                    session.send_error(Some(&id), &err);
                }
            }
        }))
    }

    fn unsubscribe(&self, id: SubscriptionId) -> Option<JoinHandle<()>> {
        let slot = self.inner.state.lock().subscriptions.remove(&id);
        let Some(slot) = slot else {
            self.send_error(
                Some(&id),
                &ApiError::not_found(format!("no subscription `{id}`")),
            );
            return None;
        };
        slot.active.store(false, Ordering::Release);

        let session = self.clone();
        Some(tokio::spawn(async move {
            let result = release(slot).await;
            session.inner.manager.metrics.record_unsubscribe();
            match result {
                Ok(()) => debug!(subscription_id = %id, "Unsubscribed"),
                Err(err) => session.send_error(Some(&id), &err),
            }
        }))
    }

    /// Tear down every remaining subscription.
    ///
    /// Waits for registrations still in flight. Individual failures are
    /// logged and never stop the others.
    pub async fn close(&self) {
        let slots: Vec<(SubscriptionId, Slot)> = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            state.subscriptions.drain().collect()
        };
        for (_, slot) in &slots {
            slot.active.store(false, Ordering::Release);
        }

        let count = slots.len();
        let results = join_all(
            slots
                .into_iter()
                .map(|(id, slot)| async move { (id, release(slot).await) }),
        )
        .await;

        let metrics = &self.inner.manager.metrics;
        for (id, result) in results {
            metrics.record_unsubscribe();
            if let Err(err) = result {
                warn!(
                    connection_id = %self.inner.connection_id,
                    subscription_id = %id,
                    error = %err,
                    "Unsubscribe failed during close"
                );
            }
        }
        info!(connection_id = %self.inner.connection_id, released = count, "Session closed");
    }

    fn send_error(&self, id: Option<&SubscriptionId>, err: &ApiError) {
        let connection_id = self.inner.connection_id;
        if err.code() == ApiErrorCode::Unknown {
            error!(%connection_id, subscription_id = ?id.map(SubscriptionId::as_str), error = %err, "Request failed");
        } else {
            debug!(%connection_id, subscription_id = ?id.map(SubscriptionId::as_str), error = %err, "Request rejected");
        }

        let manager = &self.inner.manager;
        let frame = ServerMessage::error(err, manager.config.expose_server_stack);
        if self.inner.outbound.send_message(&frame) {
            manager.metrics.record_error_frame();
        }
    }
}

async fn release(slot: Slot) -> Result<(), ApiError> {
    let unsubscribe = slot
        .pending
        .await
        .map_err(|_| ApiError::unknown("subscription task ended without registering"))?;
    AssertUnwindSafe(unsubscribe.run())
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(ApiError::unknown("unsubscribe panicked")))
}

/// Publishes for one subscription id until it is unsubscribed.
struct SubscriptionPublisher {
    id: SubscriptionId,
    active: Arc<AtomicBool>,
    outbound: OutboundSender,
    metrics: Arc<GatewayMetrics>,
}

impl Publish for SubscriptionPublisher {
    fn publish(&self, message: Value) {
        if !self.active.load(Ordering::Acquire) {
            trace!(subscription_id = %self.id, "Dropping message for inactive subscription");
            return;
        }
        let frame = ServerMessage::Message {
            id: self.id.clone(),
            message,
        };
        if self.outbound.send_message(&frame) {
            self.metrics.record_message();
        }
    }
}
