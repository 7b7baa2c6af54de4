//! Domain subscription handlers.

pub mod comments;

pub use comments::{
    Comment, CommentInsert, Comments, PostCommentsEvent, PublishCommentInput,
    PublishCommentOutput, WatchPostComments, WatchPostCommentsInput, COMMENT_INSERT_CHANNEL,
    WATCH_POST_COMMENTS,
};

use crate::ws::router::SubscriptionRouter;
use relay_bus::{BusError, ChannelRegistry};

/// Router with every domain subscription registered.
pub fn routes(registry: &ChannelRegistry) -> Result<SubscriptionRouter, BusError> {
    Ok(SubscriptionRouter::new().route(WATCH_POST_COMMENTS, WatchPostComments::new(registry.clone())?))
}
