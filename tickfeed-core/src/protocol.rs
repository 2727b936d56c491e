//! WebSocket message types for the tick feed
//!
//! These types define the protocol between the server and clients. Client
//! requests arrive as loosely-typed JSON objects; server pushes are tagged
//! JSON envelopes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{FeedError, FeedResult};

// ============================================================================
// Client -> Server Messages
// ============================================================================

/// Raw request decoded from a client frame
///
/// Decoding is lenient: fields that are missing or have the wrong JSON type
/// decode to empty values, and non-string entries of `value` are dropped.
/// Validation happens in [`ClientRequest::into_command`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientRequest {
    pub action: String,
    pub value: Vec<String>,
    pub user_id: String,
}

impl ClientRequest {
    /// Decode a raw text frame
    pub fn decode(raw: &str) -> FeedResult<Self> {
        let parsed: Value =
            serde_json::from_str(raw).map_err(|e| FeedError::invalid_json(e.to_string()))?;
        Ok(Self::from_value(&parsed))
    }

    /// Extract request fields from an already parsed JSON value
    pub fn from_value(json: &Value) -> Self {
        let Some(obj) = json.as_object() else {
            return Self::default();
        };

        let action = obj
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let value = obj
            .get("value")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let user_id = obj
            .get("userId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Self {
            action,
            value,
            user_id,
        }
    }

    /// Validate the request and turn it into a command
    ///
    /// A missing user id is reported before an unknown action.
    pub fn into_command(self) -> FeedResult<ClientCommand> {
        if self.user_id.is_empty() {
            return Err(FeedError::MissingUserId);
        }

        let symbols = normalize_symbols(self.value);
        match self.action.as_str() {
            "subscribe" => Ok(ClientCommand::Subscribe {
                user_id: self.user_id,
                symbols,
            }),
            "unsubscribe" => Ok(ClientCommand::Unsubscribe {
                user_id: self.user_id,
                symbols,
            }),
            _ => Err(FeedError::unknown_action(self.action)),
        }
    }
}

/// Trim symbol names, drop empty ones and duplicates, keep first-seen order
fn normalize_symbols(raw: Vec<String>) -> Vec<String> {
    let mut symbols: Vec<String> = Vec::with_capacity(raw.len());
    for symbol in raw {
        let symbol = symbol.trim();
        if symbol.is_empty() || symbols.iter().any(|s| s == symbol) {
            continue;
        }
        symbols.push(symbol.to_string());
    }
    symbols
}

/// Validated client command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    /// Start receiving events for the given symbols
    Subscribe { user_id: String, symbols: Vec<String> },
    /// Stop receiving events for the given symbols
    Unsubscribe { user_id: String, symbols: Vec<String> },
}

impl ClientCommand {
    pub fn user_id(&self) -> &str {
        match self {
            Self::Subscribe { user_id, .. } => user_id,
            Self::Unsubscribe { user_id, .. } => user_id,
        }
    }

    pub fn symbols(&self) -> &[String] {
        match self {
            Self::Subscribe { symbols, .. } => symbols,
            Self::Unsubscribe { symbols, .. } => symbols,
        }
    }
}

// ============================================================================
// Server -> Client Messages
// ============================================================================

/// Messages pushed from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// A tick event for a subscribed symbol; `data` is forwarded unmodified
    #[serde(rename = "marketfeed")]
    MarketFeed { data: Value },
    /// Keepalive frame
    Heartbeat,
}

impl ServerMessage {
    pub fn market_feed(data: Value) -> Self {
        Self::MarketFeed { data }
    }

    /// Encode to the text sent over the wire
    pub fn encode(&self) -> FeedResult<String> {
        serde_json::to_string(self).map_err(|e| FeedError::serialization(e.to_string()))
    }
}
