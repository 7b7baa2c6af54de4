//! Shared fixtures for the integration suite.
//!
//! The in-memory store emulates the `post` and `comment` tables with a
//! row-level security rule: a scoped transaction only sees posts whose
//! `members` contain its account, and comments on those posts. Unscoped
//! transactions see every row.

use anyhow::{anyhow, bail, Context, Result};
use futures::{SinkExt, StreamExt};
use relay_bus::{ChannelName, ChannelRegistry, InMemoryFeed};
use relay_gateway::handlers::{self, Comments, PublishCommentInput, COMMENT_INSERT_CHANNEL};
use relay_gateway::{
    ApiError, GatewayConfig, GatewayMetrics, GatewayService, HmacTokenVerifier, LivenessMonitor,
};
use relay_store::{
    AccountId, Database, InMemoryStore, MemoryTransactionState, QueryResult, Row, SqlQuery,
    StoreError,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub const TEST_SECRET: &str = "integration-test-secret";

/// Fixed timestamp written by the emulated `published_at` default.
pub const PUBLISHED_AT: &str = "2024-05-01T12:00:00Z";

/// Post 42 is shared by accounts 1 and 2, post 43 belongs to account 3,
/// post 44 to account 7.
pub fn seeded_store() -> InMemoryStore {
    let store = InMemoryStore::new(execute);
    store.seed(
        "post",
        vec![
            post(42, 5, &[1, 2]),
            post(43, 0, &[3]),
            post(44, 0, &[7]),
        ],
    );
    store
}

fn post(id: i64, comment_count: i64, members: &[i64]) -> Row {
    Row::new()
        .with("id", id)
        .with("comment_count", comment_count)
        .with("members", json!(members))
}

fn id_of(row: &Row, column: &str) -> Option<i64> {
    row.get::<i64>(column).ok()
}

fn post_visible(state: &MemoryTransactionState, post_id: i64) -> bool {
    let Some(account) = state.account_id() else {
        return true;
    };
    state.table("post").iter().any(|post| {
        id_of(post, "id") == Some(post_id)
            && post
                .get::<Vec<i64>>("members")
                .is_ok_and(|members| members.contains(&account.get()))
    })
}

fn int_param(query: &SqlQuery, index: usize) -> Result<i64, StoreError> {
    query
        .param(index)
        .and_then(|p| p.as_i64())
        .ok_or_else(|| StoreError::Decode(format!("parameter ${} is not an integer", index + 1)))
}

fn execute(state: &mut MemoryTransactionState, query: &SqlQuery) -> Result<QueryResult, StoreError> {
    let text = query.text();

    if text.starts_with("SELECT comment_count FROM post") {
        let id = int_param(query, 0)?;
        if !post_visible(state, id) {
            return Ok(QueryResult::empty());
        }
        let rows = state
            .table("post")
            .iter()
            .filter(|post| id_of(post, "id") == Some(id))
            .map(|post| Row::new().with("comment_count", post.value("comment_count").cloned().unwrap_or_default()))
            .collect();
        return Ok(QueryResult::new(rows));
    }

    if text.starts_with("SELECT id, post_id, author_id, published_at, content FROM comment WHERE id") {
        let id = int_param(query, 0)?;
        let rows = state
            .table("comment")
            .iter()
            .filter(|c| id_of(c, "id") == Some(id))
            .filter(|c| id_of(c, "post_id").is_some_and(|post| post_visible(state, post)))
            .cloned()
            .collect();
        return Ok(QueryResult::new(rows));
    }

    if text.starts_with("SELECT id FROM comment") {
        let rows = state
            .table("comment")
            .iter()
            .filter(|c| id_of(c, "post_id").is_some_and(|post| post_visible(state, post)))
            .map(|c| Row::new().with("id", c.value("id").cloned().unwrap_or_default()))
            .collect();
        return Ok(QueryResult::new(rows));
    }

    if text.starts_with("INSERT INTO comment") {
        let id = int_param(query, 0)?;
        let post_id = int_param(query, 1)?;
        if state.account_id().is_none() || !post_visible(state, post_id) {
            return Err(StoreError::InsufficientPrivilege(
                "new row violates row-level security policy for table \"comment\"".into(),
            ));
        }
        if state.table("comment").iter().any(|c| id_of(c, "id") == Some(id)) {
            return Err(StoreError::UniqueViolation("comment_pkey".into()));
        }
        let row = Row::new()
            .with("id", id)
            .with("post_id", post_id)
            .with("author_id", query.param(2).map(|p| p.to_json()).unwrap_or_default())
            .with("published_at", PUBLISHED_AT)
            .with("content", query.param(3).map(|p| p.to_json()).unwrap_or_default());
        state.table_mut("comment").push(row);

        // comment_count trigger
        for post in state.table_mut("post").iter_mut() {
            if id_of(post, "id") == Some(post_id) {
                let count = id_of(post, "comment_count").unwrap_or_default();
                post.insert("comment_count", count + 1);
            }
        }
        return Ok(QueryResult::new(vec![Row::new().with("published_at", PUBLISHED_AT)]));
    }

    Err(StoreError::Database {
        code: Some("42601".into()),
        message: format!("unsupported statement: {text}"),
    })
}

pub fn comment_channel() -> ChannelName {
    ChannelName::new(COMMENT_INSERT_CHANNEL).unwrap()
}

/// Store channel name as seen by the feed.
pub fn store_channel() -> String {
    format!("relay.{COMMENT_INSERT_CHANNEL}")
}

/// A gateway serving on an ephemeral port over in-memory backends.
pub struct TestGateway {
    pub addr: SocketAddr,
    pub store: InMemoryStore,
    pub database: Database,
    pub feed: InMemoryFeed,
    pub registry: ChannelRegistry,
    pub comments: Comments,
    pub liveness: Arc<LivenessMonitor>,
    pub metrics: Arc<GatewayMetrics>,
    verifier: HmacTokenVerifier,
    shutdown: Option<oneshot::Sender<()>>,
    server: JoinHandle<()>,
}

impl TestGateway {
    pub async fn start() -> Result<Self> {
        Self::start_with(|_| {}).await
    }

    /// Start with a customised config. The liveness interval defaults to an
    /// hour so tests drive it with `liveness.tick()`.
    pub async fn start_with(customize: impl FnOnce(&mut GatewayConfig)) -> Result<Self> {
        let mut config = GatewayConfig::default();
        config.auth.token_secret = TEST_SECRET.to_string();
        config.websocket.ping_interval = Duration::from_secs(3600);
        customize(&mut config);

        let store = seeded_store();
        let database = Database::new(Arc::new(store.clone()));
        let feed = InMemoryFeed::new();
        let registry = ChannelRegistry::new(Arc::new(feed.clone()), "relay.");
        let router = handlers::routes(&registry)?;
        let comments = Comments::new(registry.clone())?;
        let verifier = HmacTokenVerifier::new(config.auth.token_secret.clone());

        let service = GatewayService::new(config, database.clone(), router, Arc::new(verifier.clone()))?;
        let liveness = service.liveness();
        let metrics = service.metrics();

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown, signal) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let _ = service
                .serve(listener, async move {
                    let _ = signal.await;
                })
                .await;
        });

        Ok(Self {
            addr,
            store,
            database,
            feed,
            registry,
            comments,
            liveness,
            metrics,
            verifier,
            shutdown: Some(shutdown),
            server,
        })
    }

    pub fn url(&self, token: &str) -> String {
        format!("ws://{}/?access_token={token}", self.addr)
    }

    pub fn token(&self, account: i64) -> String {
        self.verifier.sign(AccountId::new(account))
    }

    pub async fn connect(&self, account: i64) -> Result<TestClient> {
        let (ws, _) = connect_async(self.url(&self.token(account)))
            .await
            .context("websocket handshake failed")?;
        Ok(TestClient { ws })
    }

    /// Publish a comment as `account` through the real write path.
    pub async fn publish_comment(
        &self,
        account: i64,
        id: i64,
        post_id: i64,
        content: &str,
    ) -> Result<(), ApiError> {
        let comments = self.comments.clone();
        let content = content.to_string();
        self.database
            .with_authorized(AccountId::new(account), move |tx| async move {
                comments
                    .publish_comment(&tx, PublishCommentInput { id, post_id, content })
                    .await
            })
            .await
            .map(|_| ())
    }

    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = tokio::time::timeout(Duration::from_secs(5), &mut self.server).await;
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.server.abort();
    }
}

/// Frames that arrive within this window count as a response.
pub const FRAME_TIMEOUT: Duration = Duration::from_secs(2);

/// WebSocket client speaking the subscription protocol.
pub struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    pub async fn send_json(&mut self, frame: Value) -> Result<()> {
        self.ws.send(Message::text(frame.to_string())).await?;
        Ok(())
    }

    pub async fn send_raw(&mut self, message: Message) -> Result<()> {
        self.ws.send(message).await?;
        Ok(())
    }

    pub async fn subscribe(&mut self, id: &str, path: &str, input: Value) -> Result<()> {
        self.send_json(json!({"type": "subscribe", "id": id, "path": path, "input": input}))
            .await
    }

    pub async fn watch_post(&mut self, id: &str, post_id: i64) -> Result<()> {
        self.subscribe(id, handlers::WATCH_POST_COMMENTS, json!({"postID": post_id}))
            .await
    }

    pub async fn unsubscribe(&mut self, id: &str) -> Result<()> {
        self.send_json(json!({"type": "unsubscribe", "id": id})).await
    }

    /// Next raw transport message.
    pub async fn next_raw(&mut self) -> Result<Option<Message>> {
        match tokio::time::timeout(FRAME_TIMEOUT, self.ws.next()).await {
            Ok(Some(message)) => Ok(Some(message?)),
            Ok(None) => Ok(None),
            Err(_) => bail!("no message within {FRAME_TIMEOUT:?}"),
        }
    }

    /// Next JSON frame, skipping transport control messages.
    pub async fn next_json(&mut self) -> Result<Value> {
        loop {
            match self.next_raw().await? {
                Some(Message::Text(text)) => return Ok(serde_json::from_str(text.as_str())?),
                Some(Message::Ping(_)) | Some(Message::Pong(_)) => continue,
                Some(other) => bail!("unexpected message {other:?}"),
                None => bail!("connection closed"),
            }
        }
    }

    /// Next `error` frame's code.
    pub async fn next_error_code(&mut self) -> Result<String> {
        let frame = self.next_json().await?;
        if frame["type"] != "error" {
            bail!("expected an error frame, got {frame}");
        }
        frame["error"]["code"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("error frame without code: {frame}"))
    }

    /// Read frames until `subscribed` for `id`, returning everything before it.
    pub async fn until_subscribed(&mut self, id: &str) -> Result<Vec<Value>> {
        let mut before = Vec::new();
        loop {
            let frame = self.next_json().await?;
            if frame["type"] == "subscribed" && frame["id"] == id {
                return Ok(before);
            }
            before.push(frame);
        }
    }

    /// `true` if no JSON frame arrives within `window`.
    pub async fn is_silent_for(&mut self, window: Duration) -> bool {
        loop {
            match tokio::time::timeout(window, self.ws.next()).await {
                Err(_) => return true,
                Ok(Some(Ok(Message::Ping(_)))) | Ok(Some(Ok(Message::Pong(_)))) => continue,
                Ok(_) => return false,
            }
        }
    }

    /// `true` once the server has closed the connection.
    pub async fn is_closed_by_server(&mut self) -> bool {
        loop {
            match tokio::time::timeout(FRAME_TIMEOUT, self.ws.next()).await {
                Err(_) => return false,
                Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => return true,
                Ok(Some(Ok(_))) => continue,
            }
        }
    }

    pub async fn close(mut self) -> Result<()> {
        self.ws.close(None).await?;
        Ok(())
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(check: impl FnMut() -> bool) -> bool {
    eventually_within(Duration::from_secs(2), check).await
}

/// Poll `check` until it holds or `limit` passes.
pub async fn eventually_within(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
