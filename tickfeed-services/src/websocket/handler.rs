//! WebSocket session handler
//!
//! Drives one client connection: decodes commands, updates subscriptions and
//! keeps the connection alive with heartbeats until it terminates.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, Stream, StreamExt};
use tickfeed_core::{ClientCommand, ClientRequest, FeedError, ServerMessage};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, warn};

use super::connection::Connection;
use super::subscription::SubscriptionRegistry;
use crate::stream::{ConsumerConfig, StreamSource, StreamSupervisor};

/// Timing configuration for client sessions
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Period between heartbeat frames
    pub heartbeat_interval: Duration,
    /// Silence after which the client is considered gone
    pub heartbeat_timeout: Duration,
    /// Upper bound on a single transport write
    pub write_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(20),
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Close frame or end of stream from the client
    ClientClosed,
    /// The transport reported a read failure
    ReadError,
    /// No inbound frame within the heartbeat timeout
    HeartbeatTimeout,
    /// Writing a heartbeat frame failed
    HeartbeatWriteFailed,
    /// Writing an error reply failed
    ReplyWriteFailed,
    /// A broadcast delivery failed and closed the connection
    DeliveryFailed,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            Self::ClientClosed => "client closed",
            Self::ReadError => "read error",
            Self::HeartbeatTimeout => "heartbeat timeout",
            Self::HeartbeatWriteFailed => "heartbeat write failed",
            Self::ReplyWriteFailed => "reply write failed",
            Self::DeliveryFailed => "delivery failed",
        };
        f.write_str(reason)
    }
}

/// Shared state for the WebSocket feed
#[derive(Clone)]
pub struct FeedState {
    pub subscriptions: Arc<SubscriptionRegistry>,
    pub supervisor: Arc<StreamSupervisor>,
    config: SessionConfig,
}

impl FeedState {
    pub fn new(
        subscriptions: Arc<SubscriptionRegistry>,
        source: Arc<dyn StreamSource>,
        config: SessionConfig,
        consumer: ConsumerConfig,
    ) -> Self {
        let supervisor = StreamSupervisor::new(Arc::clone(&subscriptions), source, consumer);
        Self {
            subscriptions,
            supervisor: Arc::new(supervisor),
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Handle a new WebSocket connection until it terminates
    pub async fn handle_connection<S>(&self, socket: S) -> DisconnectReason
    where
        S: Stream<Item = Result<Message, WsError>>
            + Sink<Message, Error = WsError>
            + Send
            + 'static,
    {
        let (sink, stream) = socket.split();
        self.handle_split(sink, stream).await
    }

    /// Same as [`handle_connection`](Self::handle_connection) for a transport
    /// that is already split into its halves
    pub async fn handle_split<W, R>(&self, sink: W, stream: R) -> DisconnectReason
    where
        W: Sink<Message, Error = WsError> + Send + 'static,
        R: Stream<Item = Result<Message, WsError>> + Unpin + Send,
    {
        let id = self.subscriptions.next_connection_id();
        let connection = Arc::new(Connection::new(id, sink, self.config.write_timeout));
        connection.activate();
        info!("New WebSocket connection: {}", id);

        let heartbeat = tokio::spawn(self.clone().heartbeat_loop(Arc::clone(&connection)));

        let read_reason = self
            .read_loop(&connection, stream)
            .await
            .filter(|reason| self.terminate(&connection, *reason));

        let heartbeat_reason = match heartbeat.await {
            Ok(reason) => reason,
            Err(e) => {
                error!("Heartbeat task for {} failed: {}", id, e);
                None
            }
        };

        connection.close_transport().await;

        let reason = read_reason
            .or(heartbeat_reason)
            .unwrap_or(DisconnectReason::DeliveryFailed);
        debug!("Session {} finished: {}", id, reason);
        reason
    }

    /// Returns the reason the client went away, or `None` if the connection
    /// was closed from elsewhere
    async fn read_loop<R>(
        &self,
        connection: &Arc<Connection>,
        mut stream: R,
    ) -> Option<DisconnectReason>
    where
        R: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        let id = connection.id();

        loop {
            let frame = tokio::select! {
                _ = connection.closed() => return None,
                frame = stream.next() => frame,
            };

            let message = match frame {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    debug!("WebSocket error for {}: {}", id, e);
                    return Some(DisconnectReason::ReadError);
                }
                None => return Some(DisconnectReason::ClientClosed),
            };

            connection.touch();

            let outcome = match message {
                Message::Text(text) => self.handle_text(connection, text.as_str()).await,
                Message::Binary(data) => match std::str::from_utf8(&data) {
                    Ok(text) => self.handle_text(connection, text).await,
                    Err(e) => {
                        self.reply_error(connection, &FeedError::invalid_json(e.to_string()))
                            .await
                    }
                },
                Message::Ping(_) | Message::Pong(_) => {
                    debug!("Keepalive frame from {}", id);
                    None
                }
                Message::Close(_) => {
                    debug!("Close frame from {}", id);
                    return Some(DisconnectReason::ClientClosed);
                }
                Message::Frame(_) => None,
            };

            if outcome.is_some() {
                return outcome;
            }
        }
    }

    /// Decode and dispatch one client command
    async fn handle_text(&self, connection: &Arc<Connection>, raw: &str) -> Option<DisconnectReason> {
        let command = match ClientRequest::decode(raw).and_then(ClientRequest::into_command) {
            Ok(command) => command,
            Err(e) => return self.reply_error(connection, &e).await,
        };

        connection.set_user_id(command.user_id());

        match &command {
            ClientCommand::Subscribe { user_id, symbols } => {
                info!(
                    "{} (user {}) subscribing to {:?}",
                    connection.id(),
                    user_id,
                    symbols
                );
                self.supervisor.subscribe(connection, symbols);
            }
            ClientCommand::Unsubscribe { user_id, symbols } => {
                info!(
                    "{} (user {}) unsubscribing from {:?}",
                    connection.id(),
                    user_id,
                    symbols
                );
                self.supervisor.unsubscribe(connection, symbols);
            }
        }

        None
    }

    /// Send a protocol error back as plain text; the session continues
    async fn reply_error(
        &self,
        connection: &Connection,
        err: &FeedError,
    ) -> Option<DisconnectReason> {
        warn!("Rejected message from {}: {:?}", connection.id(), err);
        match connection.send_text(err.to_string()).await {
            Ok(()) => None,
            Err(e) => {
                warn!("Error sending reply to {}: {}", connection.id(), e);
                Some(DisconnectReason::ReplyWriteFailed)
            }
        }
    }

    /// Close the connection and drop its subscriptions
    ///
    /// Only the first caller for a connection does the cleanup and gets true.
    fn terminate(&self, connection: &Connection, reason: DisconnectReason) -> bool {
        if !connection.close() {
            return false;
        }
        self.subscriptions.handle_disconnection(connection);
        info!("WebSocket connection closed: {} ({})", connection.id(), reason);
        true
    }

    async fn heartbeat_loop(self, connection: Arc<Connection>) -> Option<DisconnectReason> {
        let frame = match ServerMessage::Heartbeat.encode() {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode heartbeat: {}", e);
                return None;
            }
        };

        let period = self.config.heartbeat_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = connection.closed() => return None,
                _ = ticker.tick() => {}
            }

            if connection.idle_for() >= self.config.heartbeat_timeout {
                warn!("Heartbeat timeout for {}", connection.id());
                let reason = DisconnectReason::HeartbeatTimeout;
                return self.terminate(&connection, reason).then_some(reason);
            }

            if let Err(e) = connection.send_text(frame.as_str()).await {
                warn!("Error sending heartbeat to {}: {}", connection.id(), e);
                let reason = DisconnectReason::HeartbeatWriteFailed;
                return self.terminate(&connection, reason).then_some(reason);
            }
        }
    }
}

impl std::fmt::Debug for FeedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedState")
            .field("subscriptions", &self.subscriptions)
            .field("supervisor", &self.supervisor)
            .field("config", &self.config)
            .finish()
    }
}
