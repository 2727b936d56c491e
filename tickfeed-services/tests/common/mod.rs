//! Shared harness for session-level tests
//!
//! Clients talk to a real [`FeedState`] over in-memory channels standing in
//! for the WebSocket transport.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tickfeed_services::{
    ConsumerConfig, DisconnectReason, FeedState, MemoryStreamConfig, MemoryStreamSource,
    SessionConfig, SubscriptionRegistry,
};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

/// A server wired to an in-memory stream source
pub struct TestServer {
    pub state: FeedState,
    pub source: Arc<MemoryStreamSource>,
}

impl TestServer {
    pub fn new() -> Self {
        Self::with_config(SessionConfig::default())
    }

    pub fn with_config(session: SessionConfig) -> Self {
        let source = Arc::new(MemoryStreamSource::new(MemoryStreamConfig {
            block: Duration::from_millis(200),
            max_len: 1_000,
        }));
        let state = FeedState::new(
            Arc::new(SubscriptionRegistry::new()),
            source.clone(),
            session,
            ConsumerConfig {
                retry_delay: Duration::from_millis(20),
            },
        );
        Self { state, source }
    }

    /// Open a session whose outbound frames are readable by the client
    pub fn connect(&self) -> TestClient {
        let (inbound, stream) = mpsc::unbounded();
        let (sink, outbound) = mpsc::unbounded();
        let sink = sink.sink_map_err(|_| WsError::ConnectionClosed);
        self.spawn(inbound, Some(outbound), sink, stream)
    }

    /// Open a session whose transport rejects every write
    pub fn connect_broken(&self) -> TestClient {
        let (inbound, stream) = mpsc::unbounded();
        let (sink, outbound) = mpsc::unbounded::<Message>();
        drop(outbound);
        let sink = sink.sink_map_err(|_| WsError::ConnectionClosed);
        self.spawn(inbound, None, sink, stream)
    }

    fn spawn<W>(
        &self,
        inbound: mpsc::UnboundedSender<Result<Message, WsError>>,
        outbound: Option<mpsc::UnboundedReceiver<Message>>,
        sink: W,
        stream: mpsc::UnboundedReceiver<Result<Message, WsError>>,
    ) -> TestClient
    where
        W: futures::Sink<Message, Error = WsError> + Send + 'static,
    {
        let state = self.state.clone();
        let session = tokio::spawn(async move { state.handle_split(sink, stream).await });
        TestClient {
            inbound: Some(inbound),
            outbound,
            session,
        }
    }

    /// Wait until a consumer is blocked reading `symbol`
    pub async fn consumer_ready(&self, symbol: &str) {
        let source = Arc::clone(&self.source);
        let symbol = symbol.to_string();
        eventually(move || source.readers(&symbol) == 1).await;
    }

    pub fn publish(&self, symbol: &str, payload: Value) {
        self.source.publish(symbol, payload.to_string());
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.state.subscriptions
    }

    pub fn running_consumers(&self) -> usize {
        self.state.supervisor.running_consumers()
    }
}

pub struct TestClient {
    inbound: Option<mpsc::UnboundedSender<Result<Message, WsError>>>,
    outbound: Option<mpsc::UnboundedReceiver<Message>>,
    session: JoinHandle<DisconnectReason>,
}

impl TestClient {
    pub fn send_text(&self, text: &str) {
        if let Some(inbound) = &self.inbound {
            let _ = inbound.unbounded_send(Ok(Message::text(text)));
        }
    }

    pub fn send_frame(&self, frame: Message) {
        if let Some(inbound) = &self.inbound {
            let _ = inbound.unbounded_send(Ok(frame));
        }
    }

    pub fn subscribe(&self, user_id: &str, symbols: &[&str]) {
        let request = json!({"action": "subscribe", "value": symbols, "userId": user_id});
        self.send_text(&request.to_string());
    }

    pub fn unsubscribe(&self, user_id: &str, symbols: &[&str]) {
        let request = json!({"action": "unsubscribe", "value": symbols, "userId": user_id});
        self.send_text(&request.to_string());
    }

    /// Next outbound frame as text, failing after thirty seconds
    pub async fn recv_text(&mut self) -> String {
        let outbound = self.outbound.as_mut().expect("client has no readable transport");
        let frame = tokio::time::timeout(Duration::from_secs(30), outbound.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("transport closed");
        match frame {
            Message::Text(text) => text.as_str().to_string(),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    pub async fn recv_json(&mut self) -> Value {
        let text = self.recv_text().await;
        serde_json::from_str(&text).expect("frame is not JSON")
    }

    /// Next market feed payload, skipping heartbeats
    pub async fn recv_feed(&mut self) -> Value {
        loop {
            let frame = self.recv_json().await;
            match frame["type"].as_str() {
                Some("marketfeed") => return frame["data"].clone(),
                Some("heartbeat") => continue,
                _ => panic!("unexpected frame {}", frame),
            }
        }
    }

    /// True if no feed frame arrives within `wait`
    pub async fn no_feed_within(&mut self, wait: Duration) -> bool {
        let Some(outbound) = self.outbound.as_mut() else {
            return true;
        };
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            match tokio::time::timeout_at(deadline, outbound.next()).await {
                Err(_) | Ok(None) => return true,
                Ok(Some(Message::Text(text))) if text.as_str().contains("heartbeat") => continue,
                Ok(Some(_)) => return false,
            }
        }
    }

    /// Close the client's side and wait for the session to end
    pub async fn hang_up(mut self) -> DisconnectReason {
        self.inbound.take();
        self.finished().await
    }

    pub async fn finished(self) -> DisconnectReason {
        tokio::time::timeout(Duration::from_secs(60), self.session)
            .await
            .expect("session did not finish")
            .expect("session task panicked")
    }
}

/// Poll `condition` until it holds, failing after five seconds
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
