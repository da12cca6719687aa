//! Error types for the real-time core

use std::time::Duration;
use thiserror::Error;

/// Handshake or transport failure for a namespace connection.
///
/// Terminal variants (see [`ConnectionError::is_terminal`]) are never
/// retried with the same credentials: the caller must connect again with a
/// fresh token.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("No authentication token available")]
    MissingToken,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Connection rejected by server: {0}")]
    Rejected(String),

    #[error("Connection attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Handshake error: {0}")]
    Handshake(String),

    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),
}

impl ConnectionError {
    /// Authentication and configuration failures; another attempt with
    /// the same inputs would fail the same way
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionError::MissingToken
                | ConnectionError::Unauthorized(_)
                | ConnectionError::Rejected(_)
                | ConnectionError::InvalidUrl(_)
        )
    }
}

/// Malformed or unexpected data on the wire. Logged and dropped.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Binary payloads are not supported")]
    Binary,

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed payload for '{event}': {source}")]
    Payload {
        event: String,
        source: serde_json::Error,
    },
}

/// A single request (join, send, mark as read, ...) failed.
///
/// Surfaced to the caller of that action only; the connection stays up.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    #[error("Not connected")]
    NotConnected,

    #[error("Invalid event name: {0}")]
    InvalidEvent(String),

    #[error("Failed to serialize payload: {0}")]
    Serialize(String),

    #[error("Not joined to room {0}")]
    NotJoined(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Rejected by server: {0}")]
    Rejected(String),

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Cancelled by disconnect")]
    Cancelled,

    #[error("Connection lost before acknowledgement")]
    ConnectionLost,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Action error: {0}")]
    Action(#[from] ActionError),
}

pub type Result<T> = std::result::Result<T, Error>;
