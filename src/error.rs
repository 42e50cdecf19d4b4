//! Error types for the broker.

use crate::topic::TopicShape;
use thiserror::Error;

/// Main error type for broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A predicate or channel was used against a topic shape it wasn't built for.
    #[error("Topic shape mismatch: channel is {expected}, got {got}")]
    ShapeMismatch { expected: TopicShape, got: TopicShape },

    /// Storage became unavailable. Never retried internally.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Invalid channel name: {0:?}")]
    InvalidChannel(String),

    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,
}

impl BrokerError {
    /// True when the failure came from losing the storage connection.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, BrokerError::ConnectionLost(_))
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        BrokerError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for BrokerError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        BrokerError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for BrokerError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        BrokerError::Deserialization(e.to_string())
    }
}

impl From<regex::Error> for BrokerError {
    fn from(e: regex::Error) -> Self {
        BrokerError::InvalidPattern(e.to_string())
    }
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;
