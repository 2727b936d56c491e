//! End-to-end session scenarios over in-memory transports
//!
//! Run with: cargo test -p tickfeed-services --test feed_sessions

mod common;

use std::time::Duration;

use common::{eventually, TestServer};
use serde_json::json;
use tickfeed_services::{DisconnectReason, SessionConfig};
use tokio_tungstenite::tungstenite::Message;

#[tokio::test]
async fn test_events_route_to_symbol_subscribers_only() {
    let server = TestServer::new();
    let mut a = server.connect();
    let mut b = server.connect();
    let mut c = server.connect();

    a.subscribe("alice", &["BTC"]);
    b.subscribe("bob", &["BTC", "ETH"]);
    c.subscribe("carol", &["ETH"]);

    let registry = server.registry().clone();
    eventually(|| registry.subscriber_count("BTC") == 2 && registry.subscriber_count("ETH") == 2)
        .await;
    server.consumer_ready("BTC").await;
    server.consumer_ready("ETH").await;
    assert_eq!(server.running_consumers(), 2);

    server.publish("BTC", json!({"symbol": "BTC", "price": 64000}));
    assert_eq!(a.recv_feed().await, json!({"symbol": "BTC", "price": 64000}));
    assert_eq!(b.recv_feed().await, json!({"symbol": "BTC", "price": 64000}));

    server.publish("ETH", json!({"symbol": "ETH", "price": 3100}));
    assert_eq!(b.recv_feed().await, json!({"symbol": "ETH", "price": 3100}));
    assert_eq!(c.recv_feed().await, json!({"symbol": "ETH", "price": 3100}));

    assert!(a.no_feed_within(Duration::from_millis(100)).await);
    assert!(c.no_feed_within(Duration::from_millis(100)).await);
}

#[tokio::test]
async fn test_events_arrive_in_feed_order() {
    let server = TestServer::new();
    let mut a = server.connect();
    a.subscribe("alice", &["SOL"]);
    server.consumer_ready("SOL").await;

    for seq in 0..50 {
        server.publish("SOL", json!({"seq": seq}));
    }
    for seq in 0..50 {
        assert_eq!(a.recv_feed().await, json!({"seq": seq}));
    }
}

#[tokio::test]
async fn test_unsubscribe_stops_consumer_and_resubscribe_starts_fresh() {
    let server = TestServer::new();
    let mut a = server.connect();

    a.subscribe("alice", &["BTC"]);
    server.consumer_ready("BTC").await;
    assert_eq!(server.running_consumers(), 1);

    a.unsubscribe("alice", &["BTC"]);
    eventually(|| server.running_consumers() == 0).await;
    assert!(!server.registry().is_stream_active("BTC"));

    server.publish("BTC", json!({"missed": true}));

    a.subscribe("alice", &["BTC"]);
    server.consumer_ready("BTC").await;
    server.publish("BTC", json!({"fresh": true}));

    assert_eq!(a.recv_feed().await, json!({"fresh": true}));
    assert_eq!(server.running_consumers(), 1);
}

#[tokio::test]
async fn test_disconnect_retires_consumer() {
    let server = TestServer::new();
    let a = server.connect();
    a.subscribe("alice", &["BTC", "ETH"]);
    server.consumer_ready("BTC").await;
    server.consumer_ready("ETH").await;

    assert_eq!(a.hang_up().await, DisconnectReason::ClientClosed);

    let registry = server.registry();
    assert_eq!(registry.total_connections(), 0);
    assert_eq!(registry.total_symbols(), 0);
    eventually(|| server.running_consumers() == 0).await;
    assert_eq!(registry.active_streams(), 0);
}

#[tokio::test]
async fn test_failing_subscriber_does_not_affect_others() {
    let server = TestServer::new();
    let mut a = server.connect();
    let b = server.connect_broken();
    let mut c = server.connect();

    a.subscribe("alice", &["X"]);
    b.subscribe("bob", &["X"]);
    c.subscribe("carol", &["X"]);

    let registry = server.registry().clone();
    eventually(|| registry.subscriber_count("X") == 3).await;
    server.consumer_ready("X").await;

    server.publish("X", json!({"price": 1}));
    assert_eq!(a.recv_feed().await, json!({"price": 1}));
    assert_eq!(c.recv_feed().await, json!({"price": 1}));

    assert_eq!(b.finished().await, DisconnectReason::DeliveryFailed);
    assert_eq!(registry.subscriber_count("X"), 2);

    server.publish("X", json!({"price": 2}));
    assert_eq!(a.recv_feed().await, json!({"price": 2}));
    assert_eq!(c.recv_feed().await, json!({"price": 2}));
}

#[tokio::test]
async fn test_protocol_replies_and_binary_frames() {
    let server = TestServer::new();
    let mut a = server.connect();

    a.send_text("[1, 2, 3");
    assert_eq!(a.recv_text().await, "Invalid JSON format");

    a.send_text(r#"{"action":"subscribe","value":["BTC"],"userId":""}"#);
    assert_eq!(a.recv_text().await, "Missing userId");

    a.send_text(r#"{"action":"trade","value":["BTC"],"userId":"alice"}"#);
    assert_eq!(a.recv_text().await, "Unknown action");

    a.send_frame(Message::binary(vec![0xff, 0xfe]));
    assert_eq!(a.recv_text().await, "Invalid JSON format");

    let request = br#"{"action":"subscribe","value":[" BTC ",""],"userId":"alice"}"#;
    a.send_frame(Message::binary(request.to_vec()));
    let registry = server.registry().clone();
    eventually(|| registry.subscriber_count("BTC") == 1).await;
    assert_eq!(registry.total_symbols(), 1);

    server.consumer_ready("BTC").await;
    server.publish("BTC", json!({"ok": true}));
    assert_eq!(a.recv_feed().await, json!({"ok": true}));
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_timeout_removes_silent_client() {
    let server = TestServer::with_config(SessionConfig {
        heartbeat_interval: Duration::from_secs(5),
        heartbeat_timeout: Duration::from_secs(20),
        write_timeout: Duration::from_secs(10),
    });
    let silent = server.connect();
    let chatty = server.connect();

    silent.subscribe("sam", &["BTC", "ETH"]);
    chatty.subscribe("cat", &["BTC"]);

    for _ in 0..6 {
        tokio::time::sleep(Duration::from_secs(4)).await;
        chatty.send_frame(Message::Ping(Vec::new().into()));
    }

    assert_eq!(silent.finished().await, DisconnectReason::HeartbeatTimeout);

    let registry = server.registry();
    assert_eq!(registry.subscriber_count("BTC"), 1);
    assert_eq!(registry.subscriber_count("ETH"), 0);
    assert_eq!(registry.total_connections(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_write_failure_removes_client() {
    let server = TestServer::new();
    let broken = server.connect_broken();
    broken.subscribe("bob", &["BTC"]);

    assert_eq!(
        broken.finished().await,
        DisconnectReason::HeartbeatWriteFailed
    );

    let registry = server.registry();
    assert_eq!(registry.subscriber_count("BTC"), 0);
    assert_eq!(registry.total_connections(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_frames_are_sent() {
    let server = TestServer::new();
    let mut a = server.connect();
    a.subscribe("alice", &["BTC"]);

    assert_eq!(a.recv_json().await, json!({"type": "heartbeat"}));
    a.send_frame(Message::Pong(Vec::new().into()));
    assert_eq!(a.recv_json().await, json!({"type": "heartbeat"}));
}
