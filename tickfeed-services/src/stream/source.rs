//! Interface to the upstream feed

use std::str::FromStr;

use async_trait::async_trait;

/// Identifier of an event within a symbol's stream, `<millis>-<seq>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct EventId {
    pub millis: u64,
    pub seq: u64,
}

impl EventId {
    pub fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }

    /// Smallest id greater than `self` at wall-clock time `now_millis`
    pub fn successor(self, now_millis: u64) -> Self {
        if now_millis > self.millis {
            Self::new(now_millis, 0)
        } else {
            Self::new(self.millis, self.seq + 1)
        }
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for EventId {
    type Err = StreamSourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StreamSourceError::InvalidEventId(s.to_string());
        let (millis, seq) = s.split_once('-').ok_or_else(invalid)?;
        Ok(Self {
            millis: millis.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

/// Where to resume reading a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    /// Only events appended after the read starts
    Latest,
    /// Events strictly after the given id
    After(EventId),
}

/// One event read from a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: EventId,
    /// Raw JSON text of the event, if the entry carried one
    pub payload: Option<String>,
}

/// Errors reading from the upstream feed
#[derive(Debug, thiserror::Error)]
pub enum StreamSourceError {
    #[error("Stream source unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid event id: {0}")]
    InvalidEventId(String),
}

/// Ordered per-symbol event streams with a blocking read
#[async_trait]
pub trait StreamSource: Send + Sync {
    /// Wait for the first event after `cursor` on `symbol`'s stream
    ///
    /// Returns `Ok(None)` if nothing arrived within the source's wait bound.
    async fn read_next(
        &self,
        symbol: &str,
        cursor: Cursor,
    ) -> Result<Option<StreamEntry>, StreamSourceError>;

    /// Id of the newest event on `symbol`'s stream, or the zero id if empty
    ///
    /// Reading after the returned id yields only events appended later.
    async fn tail(&self, symbol: &str) -> Result<EventId, StreamSourceError>;

    /// Append an event carrying `payload` to `symbol`'s stream
    async fn publish_event(
        &self,
        symbol: &str,
        payload: String,
    ) -> Result<EventId, StreamSourceError>;
}
