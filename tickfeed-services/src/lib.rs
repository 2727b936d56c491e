//! Business logic services for the tick feed server
//!
//! This crate provides the subscription registry, per-connection sessions,
//! the fan-out broadcast engine and the per-symbol stream consumers that
//! pull events from an upstream feed (in-process or Redis Streams).

pub mod stream;
pub mod websocket;

#[cfg(test)]
pub(crate) mod test_support;

pub use stream::{
    ConsumerConfig, Cursor, EventId, MemoryStreamConfig, MemoryStreamSource, RedisStreamConfig,
    RedisStreamSource, StreamEntry, StreamSource, StreamSourceError, StreamSupervisor,
};
pub use websocket::{
    BroadcastEngine, BroadcastOutcome, Connection, ConnectionId, DisconnectReason, FeedState,
    SessionConfig, SessionState, SubscriptionRegistry, TransportError,
};
