//! In-process stream source
//!
//! Keeps a capped, ordered log per symbol. Readers block until an entry
//! newer than their cursor is appended or the configured wait bound elapses.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use super::source::{Cursor, EventId, StreamEntry, StreamSource, StreamSourceError};

/// Configuration for the in-memory source
#[derive(Debug, Clone)]
pub struct MemoryStreamConfig {
    /// How long a read waits for a new entry before returning empty
    pub block: Duration,
    /// Entries kept per symbol; older ones are trimmed
    pub max_len: usize,
}

impl Default for MemoryStreamConfig {
    fn default() -> Self {
        Self {
            block: Duration::from_secs(5),
            max_len: 10_000,
        }
    }
}

#[derive(Default)]
struct StreamLog {
    entries: VecDeque<StreamEntry>,
    last_id: EventId,
}

#[derive(Default)]
struct MemoryStream {
    log: Mutex<StreamLog>,
    appended: Notify,
    /// Reads currently blocked on this stream
    readers: AtomicUsize,
}

impl MemoryStream {
    fn append(&self, payload: Option<String>, max_len: usize) -> EventId {
        let id = {
            let mut log = self.log.lock();
            let id = log.last_id.successor(now_millis());
            log.last_id = id;
            log.entries.push_back(StreamEntry { id, payload });
            while log.entries.len() > max_len {
                log.entries.pop_front();
            }
            id
        };
        self.appended.notify_waiters();
        id
    }

    fn last_id(&self) -> EventId {
        self.log.lock().last_id
    }

    fn next_after(&self, after: EventId) -> Option<StreamEntry> {
        let log = self.log.lock();
        let idx = log.entries.partition_point(|entry| entry.id <= after);
        log.entries.get(idx).cloned()
    }

    /// Nothing was ever appended and nobody is waiting
    fn is_unused(&self) -> bool {
        self.readers.load(Ordering::SeqCst) == 0 && self.log.lock().last_id == EventId::default()
    }
}

/// Registers a read on a symbol's stream for as long as it is alive
///
/// Reading a symbol nobody published to creates its stream so the reader has
/// something to wait on. The last reader to leave removes it again if it is
/// still unused.
struct ReaderGuard<'a> {
    source: &'a MemoryStreamSource,
    symbol: &'a str,
    stream: Arc<MemoryStream>,
}

impl<'a> ReaderGuard<'a> {
    fn enter(source: &'a MemoryStreamSource, symbol: &'a str) -> Self {
        // Counted under the map entry lock so removal never races a new reader
        let stream = {
            let entry = source.streams.entry(symbol.to_string()).or_default();
            entry.readers.fetch_add(1, Ordering::SeqCst);
            Arc::clone(entry.value())
        };
        Self {
            source,
            symbol,
            stream,
        }
    }
}

impl Drop for ReaderGuard<'_> {
    fn drop(&mut self) {
        if self.stream.readers.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.source
                .streams
                .remove_if(self.symbol, |_, stream| stream.is_unused());
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Stream source backed by process memory
pub struct MemoryStreamSource {
    streams: DashMap<String, Arc<MemoryStream>>,
    config: MemoryStreamConfig,
}

impl MemoryStreamSource {
    pub fn new(config: MemoryStreamConfig) -> Self {
        Self {
            streams: DashMap::new(),
            config,
        }
    }

    /// Append an event with a JSON payload
    pub fn publish(&self, symbol: &str, payload: impl Into<String>) -> EventId {
        self.append(symbol, Some(payload.into()))
    }

    /// Append an entry; entries without a payload are skipped by consumers
    pub fn append(&self, symbol: &str, payload: Option<String>) -> EventId {
        let max_len = self.config.max_len.max(1);
        let id = self
            .streams
            .entry(symbol.to_string())
            .or_default()
            .append(payload, max_len);
        debug!("Appended {} to stream {}", id, symbol);
        id
    }

    /// Number of entries retained for a symbol
    pub fn len(&self, symbol: &str) -> usize {
        self.streams
            .get(symbol)
            .map(|stream| stream.log.lock().entries.len())
            .unwrap_or(0)
    }

    /// Id of the newest entry ever appended for a symbol
    pub fn last_id(&self, symbol: &str) -> Option<EventId> {
        self.streams.get(symbol).and_then(|stream| {
            let id = stream.last_id();
            (id != EventId::default()).then_some(id)
        })
    }

    /// Number of reads currently blocked on a symbol
    pub fn readers(&self, symbol: &str) -> usize {
        self.streams
            .get(symbol)
            .map(|stream| stream.readers.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Number of symbols that have a stream
    ///
    /// Streams exist for symbols that were published to or are being read.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }
}

impl Default for MemoryStreamSource {
    fn default() -> Self {
        Self::new(MemoryStreamConfig::default())
    }
}

impl std::fmt::Debug for MemoryStreamSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStreamSource")
            .field("streams", &self.stream_count())
            .field("config", &self.config)
            .finish()
    }
}

#[async_trait]
impl StreamSource for MemoryStreamSource {
    async fn read_next(
        &self,
        symbol: &str,
        cursor: Cursor,
    ) -> Result<Option<StreamEntry>, StreamSourceError> {
        let reader = ReaderGuard::enter(self, symbol);
        let stream = &reader.stream;

        let after = match cursor {
            Cursor::Latest => stream.last_id(),
            Cursor::After(id) => id,
        };
        let deadline = Instant::now() + self.config.block;

        loop {
            let notified = stream.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(entry) = stream.next_after(after) {
                return Ok(Some(entry));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn tail(&self, symbol: &str) -> Result<EventId, StreamSourceError> {
        Ok(self
            .streams
            .get(symbol)
            .map(|stream| stream.last_id())
            .unwrap_or_default())
    }

    async fn publish_event(
        &self,
        symbol: &str,
        payload: String,
    ) -> Result<EventId, StreamSourceError> {
        Ok(self.publish(symbol, payload))
    }
}
