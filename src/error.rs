//! Error types for maxwell-client

use thiserror::Error;

/// Errors surfaced by connections, codecs and the endpoint picker.
///
/// `Clone` so a single reason can reject every waiter of a condition.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    #[error("Failed to encode msg: reason: {0}")]
    Encode(String),

    #[error("Failed to send msg: reason: connection lost")]
    NotConnected,

    #[error("Failed to send msg: reason: {0}")]
    TransportSend(String),

    #[error("Failed to decode msg: reason: {0}")]
    Decode(String),

    #[error("code: {code}, desc: {desc}")]
    Protocol { code: i32, desc: String },

    #[error("{0}")]
    Timeout(String),

    #[error("Failed to pick endpoint: {0}")]
    PickEndpoint(String),

    #[error("Connection not ready: {0}")]
    NotReady(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ConnectionError {
    /// True for deadline expiry of a request or a condition wait.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ConnectionError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, ConnectionError>;
