//! Error types for the feed protocol

use thiserror::Error;

/// Errors raised while handling a client request.
///
/// The `Display` text of each variant is exactly what gets written back to
/// the client as a plain-text reply.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    #[error("Invalid JSON format")]
    InvalidJson(String),

    #[error("Missing userId")]
    MissingUserId,

    #[error("Unknown action")]
    UnknownAction(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl FeedError {
    pub fn invalid_json(msg: impl Into<String>) -> Self {
        FeedError::InvalidJson(msg.into())
    }

    pub fn unknown_action(action: impl Into<String>) -> Self {
        FeedError::UnknownAction(action.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        FeedError::Serialization(msg.into())
    }
}

/// Result type alias for feed operations
pub type FeedResult<T> = Result<T, FeedError>;
