//! The `error` module defines the error types used within `qrelay`.
//!
//! Failures are grouped by where they are handled: transport errors come out
//! of a broker implementation, the connection/declare/publish errors are what
//! the loops act on, and `RelayError` is what ends a run.

use std::time::Duration;

use thiserror::Error;

/// A failure reported by a broker implementation.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("access refused: {0}")]
    AccessRefused(String),

    #[error("queue '{queue}' cannot be declared: {reason}")]
    QueueConflict { queue: String, reason: String },

    #[error("message for queue '{0}' was returned as unroutable")]
    Unroutable(String),

    #[error("broker refused to confirm the message")]
    Nacked,

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Failures worth retrying when establishing a connection.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Timeout(_))
    }

    /// Failures that mean the session is gone and must be re-established.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost(_) | Self::Unreachable(_) | Self::Timeout(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("gave up connecting to {endpoint} after {attempts} attempts: {source}")]
    Exhausted {
        endpoint: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("cannot connect to {endpoint}: {source}")]
    Fatal {
        endpoint: String,
        #[source]
        source: TransportError,
    },
}

#[derive(Debug, Error)]
pub enum DeclareError {
    #[error("queue declaration conflict: {0}")]
    Conflict(#[source] TransportError),

    #[error("connection lost while declaring queue: {0}")]
    ConnectionLost(#[source] TransportError),

    #[error("queue declaration failed: {0}")]
    Other(#[source] TransportError),
}

impl From<TransportError> for DeclareError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::QueueConflict { .. } | TransportError::AccessRefused(_) => {
                Self::Conflict(err)
            }
            e if e.is_connection_loss() => Self::ConnectionLost(e),
            e => Self::Other(e),
        }
    }
}

#[derive(Debug, Error)]
#[error("failed to encode message: {0}")]
pub struct EncodeError(#[from] pub serde_json::Error);

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("message body is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("message has an empty firstName")]
    EmptyFirstName,
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("publish rejected: {0}")]
    Rejected(#[source] TransportError),

    #[error("connection lost while publishing: {0}")]
    ConnectionLost(#[source] TransportError),
}

impl From<TransportError> for PublishError {
    fn from(err: TransportError) -> Self {
        if err.is_connection_loss() {
            Self::ConnectionLost(err)
        } else {
            Self::Rejected(err)
        }
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),

    #[error("invalid setting `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// A failure that ends a publisher or consumer run.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Declare(#[from] DeclareError),

    #[error("failed to subscribe: {0}")]
    Subscribe(#[source] TransportError),
}
