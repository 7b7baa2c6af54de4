//! # Channel Registry Scenarios
//!
//! LISTEN/UNLISTEN must follow the 0↔1 listener-count transitions exactly,
//! whether listeners come from direct registry calls or from WebSocket
//! subscriptions.

#[cfg(test)]
mod tests {
    use crate::support::{eventually, TestGateway};
    use futures::future::join_all;
    use relay_bus::{Channel, ChannelName, ChannelRegistry, InMemoryFeed};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn registry() -> (ChannelRegistry, InMemoryFeed) {
        let feed = InMemoryFeed::new();
        (ChannelRegistry::new(Arc::new(feed.clone()), "relay."), feed)
    }

    fn channel() -> Channel<Value> {
        Channel::new(ChannelName::new("post_update").unwrap())
    }

    #[tokio::test]
    async fn test_listen_counts_through_0_1_3_0() {
        let (registry, feed) = registry();
        let channel = channel();
        let name = "relay.post_update";
        assert_eq!(feed.connect_count(), 0);

        let first = registry.listen(&channel, |_: Value| async { Ok(()) }).await.unwrap();
        assert_eq!((feed.listen_calls(name), feed.unlisten_calls(name)), (1, 0));
        assert_eq!(feed.connect_count(), 1);

        let second = registry.listen(&channel, |_: Value| async { Ok(()) }).await.unwrap();
        let third = registry.listen(&channel, |_: Value| async { Ok(()) }).await.unwrap();
        assert_eq!(registry.listener_count(channel.name()), 3);
        assert_eq!((feed.listen_calls(name), feed.unlisten_calls(name)), (1, 0));

        first.unlisten().await.unwrap();
        second.unlisten().await.unwrap();
        assert_eq!((feed.listen_calls(name), feed.unlisten_calls(name)), (1, 0));
        third.unlisten().await.unwrap();
        assert_eq!((feed.listen_calls(name), feed.unlisten_calls(name)), (1, 1));
        assert_eq!(registry.listener_count(channel.name()), 0);

        // A second 0→1→0 cycle issues one more pair on the same connection.
        let again = registry.listen(&channel, |_: Value| async { Ok(()) }).await.unwrap();
        again.unlisten().await.unwrap();
        assert_eq!((feed.listen_calls(name), feed.unlisten_calls(name)), (2, 2));
        assert_eq!(feed.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_listeners_issue_one_listen() {
        let (registry, feed) = registry();
        feed.set_command_delay(Duration::from_millis(50));
        let channel = channel();

        let handles = join_all((0..5).map(|_| registry.listen(&channel, |_: Value| async { Ok(()) })))
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(feed.listen_calls("relay.post_update"), 1);

        join_all(handles.into_iter().map(|handle| handle.unlisten())).await;
        assert_eq!(feed.unlisten_calls("relay.post_update"), 1);
    }

    #[tokio::test]
    async fn test_failing_listener_does_not_starve_siblings() {
        let (registry, _feed) = registry();
        let channel = channel();
        let delivered = Arc::new(AtomicUsize::new(0));

        let _broken = registry
            .listen(&channel, |_: Value| async { Err::<(), _>(anyhow::anyhow!("listener bug")) })
            .await
            .unwrap();
        let counter = Arc::clone(&delivered);
        let _healthy = registry
            .listen(&channel, move |_: Value| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
            .unwrap();

        for n in 0..3 {
            registry.notify(&channel, &json!({ "n": n })).await.unwrap();
        }
        assert!(eventually(|| delivered.load(Ordering::SeqCst) == 3).await);
    }

    #[tokio::test]
    async fn test_failed_unlisten_is_retried_on_next_drain() {
        let (registry, feed) = registry();
        let channel = channel();
        let name = "relay.post_update";

        let handle = registry.listen(&channel, |_: Value| async { Ok(()) }).await.unwrap();
        feed.fail_next_unlisten();
        assert!(handle.unlisten().await.is_err());
        assert!(registry.is_listening(channel.name()));
        assert!(feed.is_listening(name));

        // Re-attaching skips LISTEN; draining again retries UNLISTEN.
        let handle = registry.listen(&channel, |_: Value| async { Ok(()) }).await.unwrap();
        assert_eq!(feed.listen_calls(name), 1);
        handle.unlisten().await.unwrap();
        assert_eq!(feed.unlisten_calls(name), 2);
        assert!(!feed.is_listening(name));
    }

    #[tokio::test]
    async fn test_websocket_subscriptions_share_one_listen() {
        let gateway = TestGateway::start().await.unwrap();
        let channel = "relay.comment_insert";

        let mut clients = Vec::new();
        for account in [1, 2, 1] {
            let mut client = gateway.connect(account).await.unwrap();
            client.watch_post("w", 42).await.unwrap();
            client.until_subscribed("w").await.unwrap();
            clients.push(client);
        }
        assert_eq!(gateway.feed.listen_calls(channel), 1);

        for client in clients {
            client.close().await.unwrap();
        }
        assert!(eventually(|| gateway.feed.unlisten_calls(channel) == 1).await);
        assert_eq!(gateway.feed.listen_calls(channel), 1);
        gateway.stop().await;
    }
}
