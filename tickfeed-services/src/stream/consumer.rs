//! Per-symbol stream consumers
//!
//! A consumer pulls events for one symbol from the [`StreamSource`] and hands
//! each of them to the [`BroadcastEngine`]. Consumers are started lazily when
//! a symbol gains its first subscriber and retire once it has none left.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::source::{Cursor, EventId, StreamEntry, StreamSource, StreamSourceError};
use crate::websocket::{
    BroadcastEngine, BroadcastOutcome, Connection, StreamActivation, SubscriptionRegistry,
};

/// Configuration for stream consumers
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Pause before retrying after the source reported an error
    pub retry_delay: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Starts and tracks stream consumers on behalf of the subscription registry
pub struct StreamSupervisor {
    subscriptions: Arc<SubscriptionRegistry>,
    source: Arc<dyn StreamSource>,
    broadcaster: BroadcastEngine,
    config: ConsumerConfig,
    running: Arc<AtomicUsize>,
}

impl StreamSupervisor {
    pub fn new(
        subscriptions: Arc<SubscriptionRegistry>,
        source: Arc<dyn StreamSource>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            broadcaster: BroadcastEngine::new(Arc::clone(&subscriptions)),
            subscriptions,
            source,
            config,
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
        &self.subscriptions
    }

    /// Subscribe a connection and start consumers for newly active symbols
    ///
    /// If the connection was closed while the subscription was being
    /// recorded, the cleanup is run again so no edge outlives it.
    pub fn subscribe(&self, connection: &Arc<Connection>, symbols: &[String]) {
        for activation in self.subscriptions.subscribe(connection, symbols) {
            self.launch(activation);
        }

        if connection.is_closed() {
            self.subscriptions.handle_disconnection(connection);
        }
    }

    pub fn unsubscribe(&self, connection: &Connection, symbols: &[String]) {
        self.subscriptions.unsubscribe(connection, symbols);
    }

    fn launch(&self, activation: StreamActivation) {
        self.running.fetch_add(1, Ordering::SeqCst);
        let consumer = StreamConsumer {
            symbol: activation.symbol,
            stop: activation.stop,
            source: Arc::clone(&self.source),
            broadcaster: self.broadcaster.clone(),
            subscriptions: Arc::clone(&self.subscriptions),
            config: self.config.clone(),
            _running: RunningGuard(Arc::clone(&self.running)),
        };
        tokio::spawn(consumer.run());
    }

    /// Number of consumer tasks currently alive
    pub fn running_consumers(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for StreamSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSupervisor")
            .field("running_consumers", &self.running_consumers())
            .field("config", &self.config)
            .finish()
    }
}

struct RunningGuard(Arc<AtomicUsize>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Worker reading one symbol's stream
struct StreamConsumer {
    symbol: String,
    stop: Arc<Notify>,
    source: Arc<dyn StreamSource>,
    broadcaster: BroadcastEngine,
    subscriptions: Arc<SubscriptionRegistry>,
    config: ConsumerConfig,
    _running: RunningGuard,
}

impl StreamConsumer {
    async fn run(self) {
        info!("Starting stream consumption for symbol: {}", self.symbol);
        // Resolved from the stream's tail on the first read
        let mut cursor: Option<EventId> = None;

        loop {
            let read = tokio::select! {
                biased;
                _ = self.stop.notified() => None,
                read = self.read(&mut cursor) => Some(read),
            };

            match read {
                // Last subscriber left; confirm before exiting
                None => {
                    if self.subscriptions.retire_stream(&self.symbol) {
                        break;
                    }
                }
                Some(Ok(None)) => continue,
                Some(Err(e)) => {
                    warn!("Error reading stream {}: {}", self.symbol, e);
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Some(Ok(Some(entry))) => {
                    cursor = Some(entry.id);
                    let Some(payload) = self.decode(&entry) else {
                        continue;
                    };

                    let outcome = self.broadcaster.broadcast(&self.symbol, &payload).await;
                    debug!("Event {} on {}: {:?}", entry.id, self.symbol, outcome);

                    if outcome == BroadcastOutcome::NoSubscribers
                        && self.subscriptions.retire_stream(&self.symbol)
                    {
                        break;
                    }
                }
            }
        }

        info!(
            "No subscribers for symbol {}. Closing stream connection",
            self.symbol
        );
    }

    async fn read(
        &self,
        cursor: &mut Option<EventId>,
    ) -> Result<Option<StreamEntry>, StreamSourceError> {
        let after = match *cursor {
            Some(id) => id,
            None => {
                let tail = self.source.tail(&self.symbol).await?;
                debug!("Consuming {} after {}", self.symbol, tail);
                *cursor = Some(tail);
                tail
            }
        };
        self.source
            .read_next(&self.symbol, Cursor::After(after))
            .await
    }

    fn decode(&self, entry: &StreamEntry) -> Option<Value> {
        let Some(raw) = entry.payload.as_deref() else {
            warn!("No payload found in message {} on {}", entry.id, self.symbol);
            return None;
        };
        match serde_json::from_str(raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(
                    "Error parsing message payload {} on {}: {}",
                    entry.id, self.symbol, e
                );
                None
            }
        }
    }
}
