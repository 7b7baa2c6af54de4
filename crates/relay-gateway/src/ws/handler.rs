//! axum WebSocket adapter for [`Session`](crate::ws::session::Session).
//!
//! The socket is split: a writer task drains the session's outbound queue,
//! the reader loop feeds frames into the session. Whichever side stops
//! first ends the connection, as does the connection's kill switch, and the
//! session is closed on every exit path.

use crate::middleware::metrics::GatewayMetrics;
use crate::ws::liveness::LivenessMonitor;
use crate::ws::session::{InboundFrame, Outbound, OutboundSender, SessionManager};
use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use relay_store::AccountId;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Drives one accepted WebSocket connection.
pub struct WebSocketHandler {
    sessions: SessionManager,
    liveness: Arc<LivenessMonitor>,
    metrics: Arc<GatewayMetrics>,
}

impl WebSocketHandler {
    pub fn new(
        sessions: SessionManager,
        liveness: Arc<LivenessMonitor>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            sessions,
            liveness,
            metrics,
        }
    }

    /// Serve `socket` for `account` until either side closes it.
    pub async fn handle(self, socket: WebSocket, account: AccountId) {
        let (outbound, queue) = OutboundSender::channel(self.sessions.config().outbound_capacity);
        let session = self.sessions.open(account, outbound.clone());
        let connection_id = session.connection_id();
        let probe = self.liveness.register(connection_id, outbound.clone());
        self.metrics.record_connect();
        info!(%connection_id, %account, "WebSocket connection opened");

        let (sink, mut stream) = socket.split();
        let mut writer = tokio::spawn(write_frames(sink, queue));

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        session.handle_frame(InboundFrame::Text(text));
                    }
                    Some(Ok(Message::Binary(data))) => {
                        session.handle_frame(InboundFrame::Binary(data));
                    }
                    Some(Ok(Message::Pong(_))) => {
                        probe.confirm();
                        self.metrics.record_pong();
                    }
                    Some(Ok(Message::Ping(_))) => {
                        // Answered by the transport.
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(%connection_id, "WebSocket closed by peer");
                        break;
                    }
                    Some(Err(err)) => {
                        warn!(%connection_id, error = %err, "WebSocket error");
                        break;
                    }
                },
                _ = &mut writer => {
                    debug!(%connection_id, "WebSocket writer stopped");
                    break;
                }
                _ = outbound.terminated() => {
                    debug!(%connection_id, "WebSocket terminated");
                    break;
                }
            }
        }

        drop(probe);
        // A writer blocked on a peer that stopped reading never finishes on
        // its own.
        writer.abort();
        session.close().await;
        self.metrics.record_disconnect();
        info!(%connection_id, "WebSocket connection closed");
    }
}

async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut queue: mpsc::Receiver<Outbound>,
) {
    while let Some(outbound) = queue.recv().await {
        let message = match outbound {
            Outbound::Text(text) => Message::Text(text),
            Outbound::Ping => Message::Ping(Vec::new()),
        };
        if let Err(err) = sink.send(message).await {
            debug!(error = %err, "WebSocket send failed");
            return;
        }
    }
    let _ = sink.close().await;
}
