//! Post comments: live comment feed and the write path that feeds it.
//!
//! Writers insert a comment and, after their transaction commits, notify
//! `comment_insert` with `{postID, commentID}`. Each watcher listens on that
//! channel, keeps the inserts for its post, and re-reads the comment as its
//! own account before publishing it, so row-level security decides what it
//! sees.

use crate::domain::error::ApiError;
use crate::ws::router::{SubscriptionHandler, Unsubscribe};
use async_trait::async_trait;
use relay_bus::{BusError, Channel, ChannelName, ChannelRegistry};
use relay_store::{
    AccountId, AfterCommitExt, AuthorizedContext, Queryable, Row, SqlQuery, StoreError,
    SubscriptionContext,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

pub const WATCH_POST_COMMENTS: &str = "/comment/watchPostComments";

pub const COMMENT_INSERT_CHANNEL: &str = "comment_insert";

/// Notification payload on [`COMMENT_INSERT_CHANNEL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentInsert {
    #[serde(rename = "postID")]
    pub post_id: i64,
    #[serde(rename = "commentID")]
    pub comment_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: i64,
    #[serde(rename = "postID")]
    pub post_id: i64,
    #[serde(rename = "authorID")]
    pub author_id: AccountId,
    #[serde(rename = "publishedAt")]
    pub published_at: String,
    pub content: String,
}

impl Comment {
    fn from_row(row: &Row) -> Result<Self, StoreError> {
        Ok(Self {
            id: row.get("id")?,
            post_id: row.get("post_id")?,
            author_id: row.get("author_id")?,
            published_at: row.get("published_at")?,
            content: row.get("content")?,
        })
    }
}

/// Messages published to a post comments subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PostCommentsEvent {
    /// Comment count at the moment the subscription started.
    Count {
        #[serde(rename = "commentCount")]
        comment_count: i64,
    },
    New { comment: Comment },
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct WatchPostCommentsInput {
    #[serde(rename = "postID")]
    pub post_id: i64,
}

fn comment_insert_channel() -> Result<Channel<CommentInsert>, BusError> {
    Ok(Channel::new(ChannelName::new(COMMENT_INSERT_CHANNEL)?))
}

/// `/comment/watchPostComments`
pub struct WatchPostComments {
    registry: ChannelRegistry,
    channel: Channel<CommentInsert>,
}

impl WatchPostComments {
    pub fn new(registry: ChannelRegistry) -> Result<Self, BusError> {
        Ok(Self {
            registry,
            channel: comment_insert_channel()?,
        })
    }
}

#[async_trait]
impl SubscriptionHandler for WatchPostComments {
    type Input = WatchPostCommentsInput;

    fn validate(&self, input: &WatchPostCommentsInput) -> Result<(), ApiError> {
        if input.post_id <= 0 {
            return Err(ApiError::bad_input(format!("invalid postID {}", input.post_id)));
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        ctx: SubscriptionContext,
        input: WatchPostCommentsInput,
    ) -> Result<Unsubscribe, ApiError> {
        let post_id = input.post_id;

        // Listen before reading the count, but forward nothing until the
        // count is out: it is always the first message, and inserts it
        // already includes are not announced twice.
        let live = Arc::new(AtomicBool::new(false));
        let listener_ctx = ctx.clone();
        let listener_live = Arc::clone(&live);
        let handle = self
            .registry
            .listen(&self.channel, move |insert: CommentInsert| {
                let ctx = listener_ctx.clone();
                let live = listener_live.load(Ordering::Acquire);
                async move {
                    if insert.post_id != post_id {
                        return Ok(());
                    }
                    if !live {
                        trace!(post_id, comment_id = insert.comment_id, "Insert before count dropped");
                        return Ok(());
                    }
                    forward_comment(&ctx, insert).await
                }
            })
            .await?;

        let count = ctx
            .with_authorized(|tx| async move {
                let result = tx
                    .query(&SqlQuery::new("SELECT comment_count FROM post WHERE id = $1").bind(post_id))
                    .await?;
                match result.first() {
                    Some(row) => Ok(row.get::<i64>("comment_count")?),
                    None => Err(ApiError::unauthorized(format!("post {post_id} is not visible"))),
                }
            })
            .await;

        let comment_count = match count {
            Ok(count) => count,
            Err(err) => {
                if let Err(unlisten) = handle.unlisten().await {
                    debug!(post_id, error = %unlisten, "Unlisten after failed subscribe failed");
                }
                return Err(err);
            }
        };

        ctx.publish(&PostCommentsEvent::Count { comment_count });
        live.store(true, Ordering::Release);
        debug!(account = %ctx.account_id(), post_id, "Watching post comments");

        Ok(Unsubscribe::new(move || async move {
            handle.unlisten().await.map_err(ApiError::from)
        }))
    }
}

async fn forward_comment(ctx: &SubscriptionContext, insert: CommentInsert) -> anyhow::Result<()> {
    let comment = ctx
        .with_authorized(|tx| async move {
            let result = tx
                .query(
                    &SqlQuery::new(
                        "SELECT id, post_id, author_id, published_at, content FROM comment WHERE id = $1",
                    )
                    .bind(insert.comment_id),
                )
                .await?;
            result.first().map(Comment::from_row).transpose()
        })
        .await?;

    match comment {
        Some(comment) => ctx.publish(&PostCommentsEvent::New { comment }),
        None => trace!(
            account = %ctx.account_id(),
            comment_id = insert.comment_id,
            "Inserted comment not visible to subscriber"
        ),
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublishCommentInput {
    pub id: i64,
    #[serde(rename = "postID")]
    pub post_id: i64,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishCommentOutput {
    #[serde(rename = "publishedAt")]
    pub published_at: String,
}

/// Comment write operations.
#[derive(Clone)]
pub struct Comments {
    registry: ChannelRegistry,
    channel: Channel<CommentInsert>,
}

impl Comments {
    pub fn new(registry: ChannelRegistry) -> Result<Self, BusError> {
        Ok(Self {
            registry,
            channel: comment_insert_channel()?,
        })
    }

    /// Insert a comment as the context's account.
    ///
    /// Watchers are notified only once the surrounding transaction commits.
    pub async fn publish_comment(
        &self,
        ctx: &AuthorizedContext,
        input: PublishCommentInput,
    ) -> Result<PublishCommentOutput, ApiError> {
        let content = input.content.trim();
        if content.is_empty() {
            return Err(ApiError::bad_input("comment content is empty"));
        }

        let result = ctx
            .query(
                &SqlQuery::new(
                    "INSERT INTO comment (id, post_id, author_id, content) VALUES ($1, $2, $3, $4) RETURNING published_at",
                )
                .bind(input.id)
                .bind(input.post_id)
                .bind(ctx.account_id())
                .bind(content),
            )
            .await?;
        let published_at: String = result
            .first()
            .ok_or_else(|| ApiError::unknown("insert returned no row"))?
            .get("published_at")?;

        let registry = self.registry.clone();
        let channel = self.channel.clone();
        let insert = CommentInsert {
            post_id: input.post_id,
            comment_id: input.id,
        };
        ctx.after_commit(move || async move {
            registry.notify(&channel, &insert).await?;
            Ok(())
        })?;

        Ok(PublishCommentOutput { published_at })
    }
}
