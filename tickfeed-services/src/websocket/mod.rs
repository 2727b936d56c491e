//! WebSocket infrastructure for streaming tick events
//!
//! This module provides per-connection sessions, the shared subscription
//! registry and the fan-out engine that delivers events to subscribers.

mod broadcast;
mod connection;
mod handler;
mod subscription;

pub use broadcast::{BroadcastEngine, BroadcastOutcome};
pub use connection::{Connection, ConnectionId, SessionState, TransportError};
pub use handler::{DisconnectReason, FeedState, SessionConfig};
pub use subscription::{StreamActivation, SubscriptionRegistry};
