//! Archiver error types

use crate::types::{Market, StreamKind};

/// Custom result type for archiver operations
pub type ArchiverResult<T> = Result<T, ArchiverError>;

/// Error types raised by the archiver core
#[derive(Debug, Clone, thiserror::Error)]
pub enum ArchiverError {
    #[error("Invalid stream identity: pair list is empty")]
    InvalidIdentity,

    #[error("Cannot create more than {limit} instances of {class}")]
    InstanceLimitExceeded { class: &'static str, limit: usize },

    #[error("No queue registered for {market} {kind}")]
    QueueNotFound { market: Market, kind: StreamKind },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid endpoint: {details}")]
    InvalidEndpoint { details: String },

    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Timeout after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl ArchiverError {
    /// Whether the error is recovered locally by reconnecting
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }
}

impl From<serde_json::Error> for ArchiverError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ArchiverError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Connection { message: err.to_string() }
    }
}

impl From<std::io::Error> for ArchiverError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<url::ParseError> for ArchiverError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidEndpoint { details: err.to_string() }
    }
}
