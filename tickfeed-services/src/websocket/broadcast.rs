//! Fan-out of stream events to subscribed connections

use std::sync::Arc;

use serde::Serialize;
use tickfeed_core::{FeedError, ServerMessage};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use super::subscription::SubscriptionRegistry;

/// Result of broadcasting one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastOutcome {
    /// Nobody listens to the symbol; its consumer should retire
    NoSubscribers,
    /// Every subscriber was attempted
    Delivered { delivered: usize, failed: usize },
    /// The event could not be encoded; no subscriber was attempted
    EncodeFailed { subscribers: usize },
}

/// Delivers events to every connection subscribed to a symbol
#[derive(Clone)]
pub struct BroadcastEngine {
    subscriptions: Arc<SubscriptionRegistry>,
}

impl BroadcastEngine {
    pub fn new(subscriptions: Arc<SubscriptionRegistry>) -> Self {
        Self { subscriptions }
    }

    /// Send `{"type":"marketfeed","data":payload}` to all subscribers of `symbol`
    ///
    /// Each delivery runs in its own task and all of them are awaited before
    /// returning, so the next event for the symbol cannot overtake this one.
    /// A connection whose write fails is closed and unsubscribed; the other
    /// deliveries are unaffected.
    pub async fn broadcast<T>(&self, symbol: &str, payload: &T) -> BroadcastOutcome
    where
        T: Serialize + ?Sized,
    {
        let Some(connections) = self.subscriptions.connections_for(symbol) else {
            debug!("conn list not found for symbol {}", symbol);
            return BroadcastOutcome::NoSubscribers;
        };

        let encoded = serde_json::to_value(payload)
            .map_err(|e| FeedError::serialization(e.to_string()))
            .and_then(|data| ServerMessage::market_feed(data).encode());
        let text: Arc<str> = match encoded {
            Ok(text) => text.into(),
            Err(e) => {
                error!("Failed to serialize event for {}: {}", symbol, e);
                return BroadcastOutcome::EncodeFailed {
                    subscribers: connections.len(),
                };
            }
        };

        let mut deliveries = JoinSet::new();
        for connection in connections {
            let text = Arc::clone(&text);
            let subscriptions = Arc::clone(&self.subscriptions);
            let symbol = symbol.to_string();

            deliveries.spawn(async move {
                match connection.send_text(&*text).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(
                            "Error sending data to {} for stream {}: {}",
                            connection.id(),
                            symbol,
                            e
                        );
                        connection.close();
                        subscriptions.handle_disconnection(&connection);
                        false
                    }
                }
            });
        }

        let mut delivered = 0;
        let mut failed = 0;
        while let Some(result) = deliveries.join_next().await {
            match result {
                Ok(true) => delivered += 1,
                Ok(false) => failed += 1,
                Err(e) => {
                    error!("Delivery task for {} aborted: {}", symbol, e);
                    failed += 1;
                }
            }
        }

        BroadcastOutcome::Delivered { delivered, failed }
    }
}

impl std::fmt::Debug for BroadcastEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastEngine")
            .field("subscriptions", &self.subscriptions)
            .finish()
    }
}
