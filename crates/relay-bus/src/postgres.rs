//! Postgres LISTEN/NOTIFY feed.
//!
//! One task owns the `PgListener`; LISTEN/UNLISTEN requests reach it over a
//! command channel and get their result back on a oneshot. `pg_notify` goes
//! through the regular pool so it never waits on the listening connection.

use crate::config::BusConfig;
use crate::error::BusError;
use crate::feed::{FeedConnection, Notification, NotificationFeed};
use async_trait::async_trait;
use sqlx::postgres::{PgListener, PgPool};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

type Reply = oneshot::Sender<Result<(), sqlx::Error>>;

enum Command {
    Listen(String, Reply),
    Unlisten(String, Reply),
}

/// Notification feed over Postgres LISTEN/NOTIFY.
#[derive(Clone)]
pub struct PgNotificationFeed {
    pool: PgPool,
    reconnect_delay: Duration,
    max_reconnect_delay: Duration,
}

impl PgNotificationFeed {
    pub fn new(pool: PgPool, config: &BusConfig) -> Self {
        Self {
            pool,
            reconnect_delay: config.reconnect_delay,
            max_reconnect_delay: config.max_reconnect_delay,
        }
    }
}

#[async_trait]
impl NotificationFeed for PgNotificationFeed {
    async fn connect(
        &self,
    ) -> Result<(Box<dyn FeedConnection>, mpsc::UnboundedReceiver<Notification>), BusError> {
        let listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (notifications, notification_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_listener(
            listener,
            command_rx,
            notifications,
            self.reconnect_delay,
            self.max_reconnect_delay,
        ));
        info!("Postgres listener connected");

        Ok((Box::new(PgFeedConnection { commands }), notification_rx))
    }

    async fn notify(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(|e| BusError::Notify {
                channel: channel.to_owned(),
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

struct PgFeedConnection {
    commands: mpsc::UnboundedSender<Command>,
}

impl PgFeedConnection {
    async fn request(
        &self,
        command: &'static str,
        channel: &str,
        build: fn(String, Reply) -> Command,
    ) -> Result<(), BusError> {
        let (reply, result) = oneshot::channel();
        self.commands
            .send(build(channel.to_owned(), reply))
            .map_err(|_| BusError::Closed)?;
        match result.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(BusError::Command {
                command,
                channel: channel.to_owned(),
                reason: err.to_string(),
            }),
            Err(_) => Err(BusError::Closed),
        }
    }
}

#[async_trait]
impl FeedConnection for PgFeedConnection {
    async fn listen(&self, channel: &str) -> Result<(), BusError> {
        self.request("LISTEN", channel, Command::Listen).await
    }

    async fn unlisten(&self, channel: &str) -> Result<(), BusError> {
        self.request("UNLISTEN", channel, Command::Unlisten).await
    }
}

async fn run_listener(
    mut listener: PgListener,
    mut commands: mpsc::UnboundedReceiver<Command>,
    notifications: mpsc::UnboundedSender<Notification>,
    reconnect_delay: Duration,
    max_reconnect_delay: Duration,
) {
    let mut delay = reconnect_delay;
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Listen(channel, reply)) => {
                    let _ = reply.send(listener.listen(&channel).await);
                }
                Some(Command::Unlisten(channel, reply)) => {
                    let _ = reply.send(listener.unlisten(&channel).await);
                }
                None => break,
            },
            received = listener.try_recv() => match received {
                Ok(Some(notification)) => {
                    delay = reconnect_delay;
                    let forwarded = notifications.send(Notification {
                        channel: notification.channel().to_owned(),
                        payload: notification.payload().to_owned(),
                    });
                    if forwarded.is_err() {
                        break;
                    }
                }
                // The next call reconnects and re-issues LISTEN for every
                // channel; notifications sent in the gap are lost.
                Ok(None) => warn!("Notification connection lost, reconnecting"),
                Err(err) => {
                    error!(error = %err, retry_in = ?delay, "Notification connection failed");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(max_reconnect_delay);
                }
            },
        }
    }
    debug!("Postgres listener task stopped");
}
