//! Redis Streams source
//!
//! Each symbol is a Redis stream whose entries carry the event JSON in a
//! `payload` field. Reads use `XREAD BLOCK`, so a reader holds its connection
//! for up to the block time; connections are pooled and every in-flight read
//! owns one exclusively.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamRangeReply, StreamReadReply};
use redis::{RedisError, Value};
use tracing::{debug, info};

use super::source::{Cursor, EventId, StreamEntry, StreamSource, StreamSourceError};

/// Field of a stream entry holding the event JSON
pub const PAYLOAD_FIELD: &str = "payload";

/// Configuration for the Redis source
#[derive(Debug, Clone)]
pub struct RedisStreamConfig {
    pub url: String,
    /// How long `XREAD` blocks before returning empty
    pub block: Duration,
    /// Approximate cap applied when publishing (`MAXLEN ~`)
    pub max_len: usize,
}

impl Default for RedisStreamConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            block: Duration::from_secs(5),
            max_len: 10_000,
        }
    }
}

/// Stream source backed by Redis Streams
pub struct RedisStreamSource {
    client: redis::Client,
    idle: Mutex<Vec<MultiplexedConnection>>,
    config: RedisStreamConfig,
}

impl RedisStreamSource {
    /// Open a client and check the server is reachable
    pub async fn connect(config: RedisStreamConfig) -> Result<Self, StreamSourceError> {
        let client = redis::Client::open(config.url.as_str()).map_err(unavailable)?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)?;
        info!("Redis initialized at {}", config.url);

        Ok(Self {
            client,
            idle: Mutex::new(vec![connection]),
            config,
        })
    }

    async fn checkout(&self) -> Result<MultiplexedConnection, StreamSourceError> {
        if let Some(connection) = self.idle.lock().pop() {
            return Ok(connection);
        }
        debug!("Opening additional Redis connection");
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)
    }

    /// Return a connection after a successful command; failed ones are dropped
    fn checkin(&self, connection: MultiplexedConnection) {
        self.idle.lock().push(connection);
    }

    fn block_millis(&self) -> u64 {
        (self.config.block.as_millis() as u64).max(1)
    }
}

impl std::fmt::Debug for RedisStreamSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamSource")
            .field("idle_connections", &self.idle.lock().len())
            .field("config", &self.config)
            .finish()
    }
}

#[async_trait]
impl StreamSource for RedisStreamSource {
    async fn read_next(
        &self,
        symbol: &str,
        cursor: Cursor,
    ) -> Result<Option<StreamEntry>, StreamSourceError> {
        let start = match cursor {
            Cursor::Latest => "$".to_string(),
            Cursor::After(id) => id.to_string(),
        };

        let mut connection = self.checkout().await?;
        let reply: Value = redis::cmd("XREAD")
            .arg("BLOCK")
            .arg(self.block_millis())
            .arg("COUNT")
            .arg(1)
            .arg("STREAMS")
            .arg(symbol)
            .arg(&start)
            .query_async(&mut connection)
            .await
            .map_err(unavailable)?;
        self.checkin(connection);

        entry_from_read_reply(&reply)
    }

    async fn tail(&self, symbol: &str) -> Result<EventId, StreamSourceError> {
        let mut connection = self.checkout().await?;
        let reply: Value = redis::cmd("XREVRANGE")
            .arg(symbol)
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut connection)
            .await
            .map_err(unavailable)?;
        self.checkin(connection);

        tail_from_range_reply(&reply)
    }

    async fn publish_event(
        &self,
        symbol: &str,
        payload: String,
    ) -> Result<EventId, StreamSourceError> {
        let mut connection = self.checkout().await?;
        let id: String = redis::cmd("XADD")
            .arg(symbol)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.config.max_len.max(1))
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .query_async(&mut connection)
            .await
            .map_err(unavailable)?;
        self.checkin(connection);

        debug!("Appended {} to stream {}", id, symbol);
        id.parse()
    }
}

fn unavailable(e: RedisError) -> StreamSourceError {
    StreamSourceError::Unavailable(e.to_string())
}

/// First entry of an `XREAD` reply; a nil reply means the block timed out
fn entry_from_read_reply(reply: &Value) -> Result<Option<StreamEntry>, StreamSourceError> {
    let reply: Option<StreamReadReply> = redis::from_redis_value(reply).map_err(unavailable)?;
    reply
        .into_iter()
        .flat_map(|reply| reply.keys)
        .flat_map(|key| key.ids)
        .next()
        .map(to_entry)
        .transpose()
}

/// Id of the single entry of an `XREVRANGE ... COUNT 1` reply
fn tail_from_range_reply(reply: &Value) -> Result<EventId, StreamSourceError> {
    let reply: StreamRangeReply = redis::from_redis_value(reply).map_err(unavailable)?;
    match reply.ids.first() {
        Some(raw) => raw.id.parse(),
        None => Ok(EventId::default()),
    }
}

fn to_entry(raw: StreamId) -> Result<StreamEntry, StreamSourceError> {
    Ok(StreamEntry {
        id: raw.id.parse()?,
        payload: raw.get::<String>(PAYLOAD_FIELD),
    })
}
