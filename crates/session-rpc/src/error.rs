//! Error types for the RPC runtime.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::protocol::{ErrorInfo, ErrorKind};
use crate::transport::TransportError;

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for RPC operations.
///
/// Errors are `Clone` because a single teardown resolves many pending calls
/// with the same reason.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The connection is gone, either through transport loss or a local close.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The remote peer refused to open a session.
    #[error("Session open rejected: {0}")]
    SessionOpen(ErrorInfo),

    /// The session is no longer open.
    #[error("Session closed")]
    SessionClosed,

    /// The peer sent something that is not a valid frame.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The root object has no method with this name.
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// The arguments did not match the method's parameters.
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// The remote method itself failed.
    #[error("Remote error: {message}")]
    Remote {
        /// Message produced by the method.
        message: String,
        /// Optional structured detail attached by the method.
        detail: Option<Value>,
    },

    /// A value could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The session or call was torn down while the call was pending.
    #[error("Call cancelled")]
    CallCancelled,

    /// The caller gave up waiting.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Transport-level failure.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Local I/O failure, such as binding a listener.
    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    /// Converts an error received in a `CallError` frame back into a local error.
    #[must_use]
    pub fn from_info(info: ErrorInfo) -> Self {
        match info.kind {
            ErrorKind::MethodNotFound => Self::MethodNotFound(info.message),
            ErrorKind::InvalidArguments => Self::InvalidArguments(info.message),
            ErrorKind::Serialization => Self::Serialization(info.message),
            ErrorKind::SessionClosed => Self::SessionClosed,
            ErrorKind::UnknownRootType
            | ErrorKind::RootConstruction
            | ErrorKind::InvalidSession => Self::SessionOpen(info),
            ErrorKind::Remote | ErrorKind::Other => Self::Remote {
                message: info.message,
                detail: info.detail,
            },
        }
    }

    /// Describes this error for the wire, so the calling side can rebuild it.
    #[must_use]
    pub fn to_info(&self) -> ErrorInfo {
        match self {
            Self::MethodNotFound(message) => ErrorInfo::new(ErrorKind::MethodNotFound, message),
            Self::InvalidArguments(message) => {
                ErrorInfo::new(ErrorKind::InvalidArguments, message)
            }
            Self::Serialization(message) => ErrorInfo::new(ErrorKind::Serialization, message),
            Self::SessionClosed => ErrorInfo::new(ErrorKind::SessionClosed, "session closed"),
            Self::SessionOpen(info) => info.clone(),
            Self::Remote { message, detail } => ErrorInfo {
                kind: ErrorKind::Remote,
                message: message.clone(),
                detail: detail.clone(),
            },
            other => ErrorInfo::new(ErrorKind::Other, other.to_string()),
        }
    }

    /// Returns true if this error ends the whole connection rather than one call.
    #[must_use]
    pub const fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed | Self::ProtocolViolation(_) | Self::Transport(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
