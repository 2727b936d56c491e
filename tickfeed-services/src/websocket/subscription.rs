//! Subscription registry for WebSocket connections
//!
//! Tracks which connections listen to which symbols, in both directions, and
//! whether a stream consumer is currently running for each symbol.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tickfeed_core::ConcurrentRegistry;
use tokio::sync::Notify;
use tracing::{debug, info};

use super::connection::{Connection, ConnectionId};

/// Per-symbol consumer state
#[derive(Debug, Clone)]
struct StreamActivity {
    active: bool,
    /// Asks the running consumer to check whether it still has subscribers
    stop: Arc<Notify>,
}

/// Permission to start the consumer for a symbol
///
/// Returned by [`SubscriptionRegistry::subscribe`] when a symbol's activity
/// flag flipped from inactive to active. The flag stays set until the worker
/// retires, so dropping an activation without starting a worker leaves the
/// symbol without a consumer.
#[must_use = "an activation must be turned into a running stream consumer"]
#[derive(Debug)]
pub struct StreamActivation {
    pub symbol: String,
    pub stop: Arc<Notify>,
}

/// Manages the symbol <-> connection relation
///
/// Lock order: a closure running under a `stream_activity` entry may read
/// `symbol_connections`, never the other way round.
pub struct SubscriptionRegistry {
    /// Next connection ID to assign
    next_connection_id: AtomicU64,
    /// Symbol -> connections listening to it
    symbol_connections: ConcurrentRegistry<String, Vec<Arc<Connection>>>,
    /// Connection -> symbols it listens to
    connection_symbols: ConcurrentRegistry<ConnectionId, HashSet<String>>,
    /// Symbol -> consumer state
    stream_activity: ConcurrentRegistry<String, StreamActivity>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::with_buckets(tickfeed_core::registry::DEFAULT_BUCKETS)
    }

    /// Create a registry whose maps start with the given bucket count
    pub fn with_buckets(buckets: usize) -> Self {
        Self {
            next_connection_id: AtomicU64::new(1),
            symbol_connections: ConcurrentRegistry::with_buckets(buckets),
            connection_symbols: ConcurrentRegistry::with_buckets(buckets),
            stream_activity: ConcurrentRegistry::with_buckets(buckets),
        }
    }

    /// Generate a new unique connection ID
    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_connection_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Register a connection for the given symbols
    ///
    /// Subscribing twice to the same symbol is a no-op. Returns one
    /// activation per symbol whose consumer must be started.
    pub fn subscribe(
        &self,
        connection: &Arc<Connection>,
        symbols: &[String],
    ) -> Vec<StreamActivation> {
        let id = connection.id();

        for symbol in symbols {
            self.symbol_connections.alter(symbol.clone(), |entry| {
                let connections = entry.get_or_insert_with(Vec::new);
                if !connections.iter().any(|c| c.id() == id) {
                    connections.push(Arc::clone(connection));
                }
            });
        }

        self.connection_symbols.alter(id, |entry| {
            entry
                .get_or_insert_with(HashSet::new)
                .extend(symbols.iter().cloned());
        });

        debug!("{} subscribed to {:?}", id, symbols);

        symbols
            .iter()
            .filter_map(|symbol| self.activate_stream(symbol))
            .collect()
    }

    /// Remove a connection from the given symbols
    pub fn unsubscribe(&self, connection: &Connection, symbols: &[String]) {
        let id = connection.id();

        for symbol in symbols {
            self.detach(symbol, id);
        }

        self.connection_symbols.alter(id, |entry| {
            if let Some(subscribed) = entry {
                for symbol in symbols {
                    subscribed.remove(symbol);
                }
                if subscribed.is_empty() {
                    *entry = None;
                }
            }
        });

        debug!("{} unsubscribed from {:?}", id, symbols);
    }

    /// Remove all subscriptions for a connection (on disconnect)
    ///
    /// Safe to call any number of times, from any task.
    pub fn handle_disconnection(&self, connection: &Connection) {
        let id = connection.id();
        let Some(symbols) = self.connection_symbols.take(&id) else {
            return;
        };

        for symbol in &symbols {
            self.detach(symbol, id);
        }

        info!(
            "{} disconnected, removed {} subscription(s)",
            id,
            symbols.len()
        );
    }

    /// Drop one edge from a symbol's connection list
    fn detach(&self, symbol: &str, id: ConnectionId) {
        let emptied = self.symbol_connections.alter(symbol.to_string(), |entry| {
            let Some(connections) = entry else {
                return false;
            };
            connections.retain(|c| c.id() != id);
            if connections.is_empty() {
                *entry = None;
                true
            } else {
                false
            }
        });

        if emptied {
            debug!("No subscribers left for {}, stopping stream", symbol);
            self.request_stream_stop(symbol);
        }
    }

    /// Flip the activity flag on if it is off
    fn activate_stream(&self, symbol: &str) -> Option<StreamActivation> {
        self.stream_activity.alter(symbol.to_string(), |entry| {
            if matches!(entry, Some(activity) if activity.active) {
                debug!("Already connected to stream for {}", symbol);
                return None;
            }
            let stop = Arc::new(Notify::new());
            *entry = Some(StreamActivity {
                active: true,
                stop: Arc::clone(&stop),
            });
            Some(StreamActivation {
                symbol: symbol.to_string(),
                stop,
            })
        })
    }

    fn request_stream_stop(&self, symbol: &str) {
        if let Some(activity) = self.stream_activity.find(symbol) {
            if activity.active {
                activity.stop.notify_one();
            }
        }
    }

    /// Called by a symbol's consumer when it sees no subscribers
    ///
    /// Returns true if the consumer must exit, in which case the symbol's
    /// activity entry is dropped. The subscriber check and the removal happen
    /// under the entry's lock, so a concurrent subscribe either keeps this
    /// worker alive or starts a new one afterwards, never neither and never
    /// both.
    pub fn retire_stream(&self, symbol: &str) -> bool {
        self.stream_activity.alter(symbol.to_string(), |entry| {
            if self.symbol_connections.contains_key(symbol) {
                return false;
            }
            *entry = None;
            true
        })
    }

    /// Current subscribers of a symbol
    pub fn connections_for(&self, symbol: &str) -> Option<Vec<Arc<Connection>>> {
        self.symbol_connections.find(symbol)
    }

    /// Symbols a connection is subscribed to
    pub fn symbols_of(&self, id: ConnectionId) -> HashSet<String> {
        self.connection_symbols.find(&id).unwrap_or_default()
    }

    /// Check if a connection is subscribed to a symbol
    pub fn is_subscribed(&self, id: ConnectionId, symbol: &str) -> bool {
        self.connection_symbols
            .find(&id)
            .map(|symbols| symbols.contains(symbol))
            .unwrap_or(false)
    }

    /// Get the number of subscribers for a symbol
    pub fn subscriber_count(&self, symbol: &str) -> usize {
        self.symbol_connections
            .find(symbol)
            .map(|connections| connections.len())
            .unwrap_or(0)
    }

    /// Whether a consumer is flagged as running for a symbol
    pub fn is_stream_active(&self, symbol: &str) -> bool {
        self.stream_activity
            .find(symbol)
            .map(|activity| activity.active)
            .unwrap_or(false)
    }

    /// Number of symbols with a running consumer
    pub fn active_streams(&self) -> usize {
        self.stream_activity
            .entries()
            .iter()
            .filter(|(_, activity)| activity.active)
            .count()
    }

    /// Number of symbols holding consumer bookkeeping, running or stopping
    pub fn tracked_streams(&self) -> usize {
        self.stream_activity.len()
    }

    /// Number of symbols with at least one subscriber
    pub fn total_symbols(&self) -> usize {
        self.symbol_connections.len()
    }

    /// Number of connections with at least one subscription
    pub fn total_connections(&self) -> usize {
        self.connection_symbols.len()
    }

    /// Every (symbol, connection) edge, as seen from the symbol side
    pub fn symbol_edges(&self) -> Vec<(String, ConnectionId)> {
        self.symbol_connections
            .entries()
            .into_iter()
            .flat_map(|(symbol, connections)| {
                connections
                    .into_iter()
                    .map(move |c| (symbol.clone(), c.id()))
            })
            .collect()
    }

    /// Every (symbol, connection) edge, as seen from the connection side
    pub fn connection_edges(&self) -> Vec<(String, ConnectionId)> {
        self.connection_symbols
            .entries()
            .into_iter()
            .flat_map(|(id, symbols)| symbols.into_iter().map(move |s| (s, id)))
            .collect()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("total_symbols", &self.total_symbols())
            .field("total_connections", &self.total_connections())
            .finish()
    }
}
