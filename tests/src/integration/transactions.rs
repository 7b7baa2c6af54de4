//! # Transaction Context Scenarios
//!
//! Commit, rollback and after-commit behaviour of `Database` against the
//! seeded store, including the comment write path.

#[cfg(test)]
mod tests {
    use crate::support::{seeded_store, TestGateway};
    use relay_gateway::ApiError;
    use relay_store::{
        AccountId, AfterCommitExt, Database, Queryable, SqlQuery, StoreError,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn comment_ids_query() -> SqlQuery {
        SqlQuery::new("SELECT id FROM comment")
    }

    #[tokio::test]
    async fn test_failed_authorized_action_rolls_back_without_hooks() {
        let gateway = TestGateway::start().await.unwrap();
        let hooks = Arc::new(AtomicUsize::new(0));

        let comments = gateway.comments.clone();
        let counter = Arc::clone(&hooks);
        let result: Result<(), ApiError> = gateway
            .database
            .with_authorized(AccountId::new(7), move |tx| async move {
                comments
                    .publish_comment(
                        &tx,
                        relay_gateway::handlers::PublishCommentInput {
                            id: 500,
                            post_id: 44,
                            content: "never seen".into(),
                        },
                    )
                    .await?;
                tx.after_commit(move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })?;
                Err(ApiError::unknown("handler failed after writing"))
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.message(), "handler failed after writing");
        assert_eq!(hooks.load(Ordering::SeqCst), 0);
        assert!(gateway.feed.sent().is_empty());

        let visible = gateway
            .database
            .with_unauthorized(|tx| async move { tx.query(&comment_ids_query()).await })
            .await
            .unwrap();
        assert!(visible.is_empty());

        let stats = gateway.store.stats();
        assert_eq!(stats.rolled_back, 1);
        assert_eq!(stats.open, 0);
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_committed_write_is_visible_and_announced() {
        let gateway = TestGateway::start().await.unwrap();

        gateway.publish_comment(7, 501, 44, "kept").await.unwrap();

        let rows = gateway
            .database
            .with_unauthorized(|tx| async move { tx.query(&comment_ids_query()).await })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows.first().unwrap().get::<i64>("id").unwrap(), 501);

        let sent = gateway.feed.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].channel, "relay.comment_insert");
        let payload: serde_json::Value = serde_json::from_str(&sent[0].payload).unwrap();
        assert_eq!(payload, serde_json::json!({"postID": 44, "commentID": 501}));
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_authorized_reads_are_scoped_to_account() {
        let store = seeded_store();
        let database = Database::new(Arc::new(store.clone()));

        let count_for = |account: i64| {
            let database = database.clone();
            async move {
                database
                    .with_authorized(AccountId::new(account), |tx| async move {
                        let result = tx
                            .query(&SqlQuery::new("SELECT comment_count FROM post WHERE id = $1").bind(42i64))
                            .await?;
                        Ok::<_, StoreError>(result.len())
                    })
                    .await
                    .unwrap()
            }
        };

        assert_eq!(count_for(1).await, 1);
        assert_eq!(count_for(2).await, 1);
        assert_eq!(count_for(3).await, 0);
        assert_eq!(store.stats().committed, 3);
    }

    #[tokio::test]
    async fn test_leaked_context_is_invalid() {
        let database = Database::new(Arc::new(seeded_store()));

        let leaked = database
            .with_unauthorized(|tx| async move { Ok::<_, StoreError>(tx) })
            .await
            .unwrap();
        assert!(!leaked.is_active());
        assert!(matches!(
            leaked.query(&comment_ids_query()).await,
            Err(StoreError::ContextInvalidated)
        ));
    }

    #[tokio::test]
    async fn test_failed_hook_does_not_change_outcome() {
        let gateway = TestGateway::start().await.unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);

        let value = gateway
            .database
            .with_unauthorized(move |tx| async move {
                tx.after_commit(|| async { Err::<(), _>(anyhow::anyhow!("broker unavailable")) })?;
                tx.after_commit(move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })?;
                Ok::<_, StoreError>(42)
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(gateway.store.stats().committed, 1);
        gateway.stop().await;
    }
}
