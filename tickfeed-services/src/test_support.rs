//! Helpers shared by unit tests

use std::collections::BTreeSet;
use std::time::Duration;

use futures::channel::mpsc;
use futures::SinkExt;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::websocket::{Connection, ConnectionId, SubscriptionRegistry};

pub fn symbols(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// Connection whose writes land in the returned receiver
pub fn channel_connection(id: u64) -> (Connection, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded();
    let sink = tx.sink_map_err(|_| WsError::ConnectionClosed);
    (
        Connection::new(ConnectionId(id), sink, Duration::from_secs(5)),
        rx,
    )
}

/// Connection whose every write fails
pub fn failing_connection(id: u64) -> Connection {
    let (conn, rx) = channel_connection(id);
    drop(rx);
    conn
}

/// Both sides of the registry describe the same set of edges
pub fn assert_edges_consistent(registry: &SubscriptionRegistry) {
    let by_symbol: BTreeSet<_> = registry.symbol_edges().into_iter().collect();
    let by_connection: BTreeSet<_> = registry.connection_edges().into_iter().collect();
    assert_eq!(by_symbol, by_connection, "subscription edges diverged");
}

/// Poll `condition` until it holds, failing the test after five seconds
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
