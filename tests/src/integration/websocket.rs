//! # WebSocket Session Scenarios
//!
//! Protocol handling, per-connection subscription lifecycle and liveness,
//! exercised over a real socket.

#[cfg(test)]
mod tests {
    use crate::support::{
        comment_channel, eventually, eventually_within, store_channel, TestClient, TestGateway,
        TEST_SECRET,
    };
    use relay_gateway::{Environment, HmacTokenVerifier};
    use relay_store::AccountId;
    use serde_json::json;
    use std::time::Duration;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message;

    // =========================================================================
    // HANDSHAKE
    // =========================================================================

    #[tokio::test]
    async fn test_upgrade_requires_valid_token() {
        let gateway = TestGateway::start().await.unwrap();

        let missing = connect_async(format!("ws://{}/", gateway.addr)).await;
        assert!(missing.is_err());

        let forged = HmacTokenVerifier::new("some-other-secret-value").sign(AccountId::new(1));
        assert!(connect_async(gateway.url(&forged)).await.is_err());

        assert!(gateway.connect(1).await.is_ok());
        assert!(eventually(|| gateway.metrics.snapshot().auth_rejected == 2).await);
        gateway.stop().await;
    }

    // =========================================================================
    // PROTOCOL ERRORS
    // =========================================================================

    #[tokio::test]
    async fn test_duplicate_subscription_id_yields_one_success() {
        let gateway = TestGateway::start().await.unwrap();
        let mut client = gateway.connect(1).await.unwrap();

        client.watch_post("a", 42).await.unwrap();
        client.watch_post("a", 42).await.unwrap();

        let mut subscribed = 0;
        let mut already_exists = 0;
        let mut counts = 0;
        while subscribed + already_exists < 2 {
            let frame = client.next_json().await.unwrap();
            match frame["type"].as_str() {
                Some("subscribed") => subscribed += 1,
                Some("message") => counts += 1,
                Some("error") => {
                    assert_eq!(frame["error"]["code"], "ALREADY_EXISTS");
                    already_exists += 1;
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert_eq!((subscribed, already_exists, counts), (1, 1, 1));
        assert_eq!(gateway.registry.listener_count(&comment_channel()), 1);
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_id_is_not_found() {
        let gateway = TestGateway::start().await.unwrap();
        let mut client = gateway.connect(1).await.unwrap();

        client.unsubscribe("ghost").await.unwrap();
        assert_eq!(client.next_error_code().await.unwrap(), "NOT_FOUND");

        client.watch_post("a", 42).await.unwrap();
        client.until_subscribed("a").await.unwrap();
        client.unsubscribe("a").await.unwrap();
        client.unsubscribe("a").await.unwrap();
        assert_eq!(client.next_error_code().await.unwrap(), "NOT_FOUND");
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_bad_frames_keep_connection_open() {
        let gateway = TestGateway::start().await.unwrap();
        let mut client = gateway.connect(1).await.unwrap();

        client.send_raw(Message::text("not json")).await.unwrap();
        assert_eq!(client.next_error_code().await.unwrap(), "BAD_INPUT");

        client.send_raw(Message::binary(vec![0u8, 1, 2])).await.unwrap();
        assert_eq!(client.next_error_code().await.unwrap(), "BAD_INPUT");

        client.send_json(json!({"type": "watch", "id": "a"})).await.unwrap();
        assert_eq!(client.next_error_code().await.unwrap(), "BAD_INPUT");

        client.subscribe("a", "/post/watchNothing", json!({})).await.unwrap();
        assert_eq!(client.next_error_code().await.unwrap(), "NOT_FOUND");

        client.watch_post("a", -1).await.unwrap();
        assert_eq!(client.next_error_code().await.unwrap(), "BAD_INPUT");

        client.subscribe("a", relay_gateway::handlers::WATCH_POST_COMMENTS, json!({})).await.unwrap();
        assert_eq!(client.next_error_code().await.unwrap(), "BAD_INPUT");

        client.watch_post("a", 42).await.unwrap();
        let before = client.until_subscribed("a").await.unwrap();
        assert_eq!(before, vec![json!({"type": "message", "id": "a", "message": {"type": "count", "commentCount": 5}})]);
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_invisible_post_is_unauthorized() {
        let gateway = TestGateway::start().await.unwrap();
        let mut client = gateway.connect(1).await.unwrap();

        client.watch_post("hidden", 43).await.unwrap();
        let frame = client.next_json().await.unwrap();
        assert_eq!(frame["error"]["code"], "UNAUTHORIZED");
        assert!(frame["error"]["serverStack"].is_string());

        assert!(eventually(|| gateway.registry.listener_count(&comment_channel()) == 0).await);
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_production_hides_server_stack() {
        let gateway = TestGateway::start_with(|config| {
            config.environment = Environment::Production;
            config.auth.token_secret = format!("{TEST_SECRET}-production");
        })
        .await
        .unwrap();
        let mut client = gateway.connect(1).await.unwrap();

        client.unsubscribe("ghost").await.unwrap();
        let frame = client.next_json().await.unwrap();
        assert_eq!(frame, json!({"type": "error", "error": {"code": "NOT_FOUND"}}));
        gateway.stop().await;
    }

    // =========================================================================
    // CONNECTION CLOSE
    // =========================================================================

    #[tokio::test]
    async fn test_close_releases_every_subscription() {
        let gateway = TestGateway::start().await.unwrap();
        let mut client = gateway.connect(1).await.unwrap();

        for id in ["a", "b", "c"] {
            client.watch_post(id, 42).await.unwrap();
            client.until_subscribed(id).await.unwrap();
        }
        assert_eq!(gateway.registry.listener_count(&comment_channel()), 3);
        assert_eq!(gateway.feed.listen_calls(&store_channel()), 1);

        client.close().await.unwrap();
        assert!(eventually(|| gateway.registry.listener_count(&comment_channel()) == 0).await);
        assert!(eventually(|| gateway.feed.unlisten_calls(&store_channel()) == 1).await);
        assert!(eventually(|| gateway.metrics.snapshot().subscriptions_active == 0).await);
        assert!(eventually(|| gateway.metrics.snapshot().connections_active == 0).await);
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_close_during_registration_still_unsubscribes() {
        let gateway = TestGateway::start().await.unwrap();
        gateway.feed.set_command_delay(Duration::from_millis(200));
        let mut client = gateway.connect(1).await.unwrap();

        client.watch_post("slow", 42).await.unwrap();
        assert!(eventually(|| gateway.metrics.snapshot().subscriptions_active == 1).await);
        client.close().await.unwrap();

        assert!(eventually(|| gateway.feed.unlisten_calls(&store_channel()) == 1).await);
        assert_eq!(gateway.feed.listen_calls(&store_channel()), 1);
        assert_eq!(gateway.registry.listener_count(&comment_channel()), 0);
        assert!(!gateway.feed.is_listening(&store_channel()));
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_shutdown_terminates_connections() {
        let gateway = TestGateway::start().await.unwrap();
        let mut client = gateway.connect(1).await.unwrap();
        client.watch_post("a", 42).await.unwrap();
        client.until_subscribed("a").await.unwrap();

        let registry = gateway.registry.clone();
        gateway.stop().await;
        assert!(client.is_closed_by_server().await);
        assert!(eventually(|| registry.listener_count(&comment_channel()) == 0).await);
    }

    // =========================================================================
    // LIVENESS
    // =========================================================================

    /// Large comments published to a watcher of post 42, enough to fill the
    /// socket buffers of a client that does not read.
    const BACKLOG_COMMENTS: i64 = 32;
    const BACKLOG_COMMENT_BYTES: usize = 1 << 20;

    async fn stalled_watcher(gateway: &TestGateway) -> TestClient {
        let mut client = gateway.connect(1).await.unwrap();
        client.watch_post("a", 42).await.unwrap();
        client.until_subscribed("a").await.unwrap();
        assert!(eventually(|| gateway.liveness.tracked() == 1).await);

        let content = "x".repeat(BACKLOG_COMMENT_BYTES);
        for id in 0..BACKLOG_COMMENTS {
            gateway.publish_comment(2, 1000 + id, 42, &content).await.unwrap();
        }
        client
    }

    #[tokio::test]
    async fn test_silent_connection_terminated_after_two_missed_probes() {
        let gateway = TestGateway::start().await.unwrap();
        let mut client = gateway.connect(1).await.unwrap();
        client.watch_post("a", 42).await.unwrap();
        client.until_subscribed("a").await.unwrap();
        assert!(eventually(|| gateway.liveness.tracked() == 1).await);

        // The client does not read, so no pong goes back.
        let first = gateway.liveness.tick();
        assert_eq!((first.pinged, first.terminated), (1, 0));
        let second = gateway.liveness.tick();
        assert_eq!((second.pinged, second.terminated), (0, 1));

        assert!(client.is_closed_by_server().await);
        assert!(eventually(|| gateway.registry.listener_count(&comment_channel()) == 0).await);
        assert_eq!(gateway.metrics.snapshot().liveness_terminations, 1);
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_stalled_reader_terminated_and_released() {
        let gateway = TestGateway::start_with(|config| {
            config.websocket.outbound_queue_capacity = 10_000;
        })
        .await
        .unwrap();
        let _client = stalled_watcher(&gateway).await;
        assert!(
            eventually_within(Duration::from_secs(10), || {
                gateway.metrics.snapshot().messages_sent == BACKLOG_COMMENTS as u64 + 1
            })
            .await
        );

        // The writer is blocked on the socket; termination must not queue
        // behind it.
        assert_eq!(gateway.liveness.tick().pinged, 1);
        assert_eq!(gateway.liveness.tick().terminated, 1);

        assert!(eventually(|| gateway.registry.listener_count(&comment_channel()) == 0).await);
        assert!(eventually(|| gateway.feed.unlisten_calls(&store_channel()) == 1).await);
        assert!(eventually(|| gateway.metrics.snapshot().connections_active == 0).await);
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_full_outbound_queue_closes_connection() {
        let gateway = TestGateway::start_with(|config| {
            config.websocket.outbound_queue_capacity = 4;
        })
        .await
        .unwrap();
        let _client = stalled_watcher(&gateway).await;

        assert!(eventually_within(Duration::from_secs(10), || {
            gateway.metrics.snapshot().connections_active == 0
        })
        .await);
        assert_eq!(gateway.registry.listener_count(&comment_channel()), 0);
        assert_eq!(gateway.feed.unlisten_calls(&store_channel()), 1);
        assert_eq!(gateway.metrics.snapshot().liveness_terminations, 0);
        assert_eq!(gateway.liveness.tracked(), 0);
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_answering_connection_survives_ticks() {
        let gateway = TestGateway::start().await.unwrap();
        let mut client = gateway.connect(1).await.unwrap();
        assert!(eventually(|| gateway.liveness.tracked() == 1).await);

        for round in 1..=3u64 {
            assert_eq!(gateway.liveness.tick().terminated, 0);
            match client.next_raw().await.unwrap() {
                Some(Message::Ping(payload)) => client.send_raw(Message::Pong(payload)).await.unwrap(),
                other => panic!("expected ping, got {other:?}"),
            }
            assert!(eventually(|| gateway.metrics.snapshot().pongs_received >= round).await);
        }
        assert_eq!(gateway.liveness.tracked(), 1);

        client.unsubscribe("ghost").await.unwrap();
        assert_eq!(client.next_error_code().await.unwrap(), "NOT_FOUND");
        gateway.stop().await;
    }
}
