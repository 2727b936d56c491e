//! Upstream event streams and the per-symbol consumers that read them

mod consumer;
mod memory;
mod redis_source;
mod source;

pub use consumer::{ConsumerConfig, StreamSupervisor};
pub use memory::{MemoryStreamConfig, MemoryStreamSource};
pub use redis_source::{RedisStreamConfig, RedisStreamSource, PAYLOAD_FIELD};
pub use source::{Cursor, EventId, StreamEntry, StreamSource, StreamSourceError};
