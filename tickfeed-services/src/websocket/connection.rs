//! Live client connections
//!
//! A [`Connection`] is shared between its own session, which reads from the
//! transport, and any number of broadcast tasks that write to it. Writes are
//! serialized through an async mutex around the transport's write half.

use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use futures_util::{Sink, SinkExt};
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

/// Write half of a client transport
pub type MessageSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;

/// Unique identifier for a client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle of a client session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Transport accepted, protocol upgrade not yet confirmed
    Handshaking = 0,
    /// Reading commands and receiving events
    Active = 1,
    /// Terminal; the connection has been or is being cleaned up
    Closed = 2,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Handshaking,
            1 => Self::Active,
            _ => Self::Closed,
        }
    }
}

/// Errors writing to a client transport
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("Write timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection closed")]
    Closed,
}

/// One client's live session as seen by the rest of the server
pub struct Connection {
    id: ConnectionId,
    state: AtomicU8,
    /// Exclusive write access to the transport
    sink: AsyncMutex<MessageSink>,
    write_timeout: Duration,
    /// Time of the last inbound frame
    last_seen: Mutex<Instant>,
    /// Wakes the session loops once the connection is closed
    shutdown: Notify,
    /// Last user id the client identified itself with
    user_id: Mutex<Option<String>>,
}

impl Connection {
    pub fn new<S>(id: ConnectionId, sink: S, write_timeout: Duration) -> Self
    where
        S: Sink<Message, Error = WsError> + Send + 'static,
    {
        Self {
            id,
            state: AtomicU8::new(SessionState::Handshaking as u8),
            sink: AsyncMutex::new(Box::pin(sink)),
            write_timeout,
            last_seen: Mutex::new(Instant::now()),
            shutdown: Notify::new(),
            user_id: Mutex::new(None),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move from `Handshaking` to `Active`; false if already past handshake
    pub fn activate(&self) -> bool {
        self.state
            .compare_exchange(
                SessionState::Handshaking as u8,
                SessionState::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Mark the connection closed and wake its session loops
    ///
    /// Returns true only for the caller that performed the transition, which
    /// makes that caller responsible for the terminal cleanup.
    pub fn close(&self) -> bool {
        let previous = self
            .state
            .swap(SessionState::Closed as u8, Ordering::AcqRel);
        if previous == SessionState::Closed as u8 {
            return false;
        }
        self.shutdown.notify_waiters();
        true
    }

    /// Resolves once the connection is closed
    pub async fn closed(&self) {
        let notified = self.shutdown.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_closed() {
            return;
        }
        notified.await;
    }

    /// Record inbound activity
    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    /// Time since the last inbound frame
    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    pub fn user_id(&self) -> Option<String> {
        self.user_id.lock().clone()
    }

    pub fn set_user_id(&self, user_id: &str) {
        let mut current = self.user_id.lock();
        if current.as_deref() != Some(user_id) {
            *current = Some(user_id.to_string());
        }
    }

    /// Write a text frame, waiting for exclusive access to the transport
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut sink = self.sink.lock().await;
        match tokio::time::timeout(self.write_timeout, sink.send(Message::text(text.into()))).await
        {
            Ok(result) => result.map_err(TransportError::from),
            Err(_) => Err(TransportError::Timeout(self.write_timeout)),
        }
    }

    /// Close the write half of the transport, ignoring failures
    pub async fn close_transport(&self) {
        let mut sink = self.sink.lock().await;
        let _ = tokio::time::timeout(self.write_timeout, sink.close()).await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("user_id", &self.user_id())
            .finish()
    }
}
