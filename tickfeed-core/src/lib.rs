//! Core types for the tick feed fan-out server
//!
//! This crate defines the wire protocol spoken with clients, the error type
//! for protocol failures, and the concurrent registry that every piece of
//! shared subscription state is built on.

pub mod error;
pub mod protocol;
pub mod registry;

pub use error::{FeedError, FeedResult};
pub use protocol::{ClientCommand, ClientRequest, ServerMessage};
pub use registry::ConcurrentRegistry;
