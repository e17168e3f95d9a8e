//! Error types for streams, brokers and the switch.

use thiserror::Error;

/// Main error type for stream and switch operations.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid subject: {0:?}")]
    InvalidSubject(String),

    #[error("Subscribe to '{domain}' failed: {reason}")]
    Subscribe { domain: String, reason: String },

    #[error("Stream is closed")]
    Closed,

    #[error("Invalid switch state: expected {expected}, got {got}")]
    InvalidState { expected: String, got: String },

    #[error("Invalid discard entry on line {line}: {reason}")]
    InvalidDiscardEntry { line: usize, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Broker directory is locked by another process")]
    Locked,

    #[error("Broker not initialized")]
    NotInitialized,

    #[error("Invalid broker format: {0}")]
    InvalidFormat(String),
}

impl From<serde_json::Error> for StreamError {
    fn from(e: serde_json::Error) -> Self {
        StreamError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StreamError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StreamError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StreamError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StreamError::Deserialization(e.to_string())
    }
}

/// Result type for stream operations.
pub type Result<T> = std::result::Result<T, StreamError>;

/// Error returned by a message handler.
///
/// Handler errors never stop a pipeline: the switch logs and counts them and
/// drops the message for that consumer only.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("decode error: {0}")]
    Decode(String),

    #[error("message rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Stream(#[from] StreamError),
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        HandlerError::Decode(e.to_string())
    }
}

/// Result type for message handlers.
pub type HandlerResult = std::result::Result<(), HandlerError>;
