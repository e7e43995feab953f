//! Error types for wirecall.

use thiserror::Error;

use crate::errno;

/// Main error type for all wirecall operations.
///
/// Setup-time failures (registration, type lookup, binding) and local
/// encoding failures surface as `Err(RpcError)`. Failures of an issued call
/// never do: they resolve the call with a non-zero error code instead.
#[derive(Debug, Error)]
pub enum RpcError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while loading configuration.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed or truncated bytes for a declared type.
    #[error("Decode error: {0}")]
    Decode(String),

    /// A value could not be encoded under its declared type.
    #[error("Encode error: {0}")]
    Encode(String),

    /// Duplicate registration, unregistered type, bad address, and the like.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Framing violation (invalid size prefix, oversized frame).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Request referenced a call ID with no registered handler.
    #[error("Unknown call ID: {0:#010x}")]
    UnknownCall(i32),

    /// Handler failed while serving a request.
    #[error("Handler error: {0}")]
    Handler(String),

    /// Operation attempted without a live connection.
    #[error("Not connected")]
    NotConnected,

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Deadline elapsed before completion.
    #[error("Timed out")]
    Timeout,

    /// The reply buffer of a future was already handed out.
    #[error("Reply already taken")]
    ReplyTaken,

    /// Backpressure timeout - write queue full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,
}

impl RpcError {
    /// Wire error code a call fails with when this error ends it.
    pub fn error_code(&self) -> i32 {
        match self {
            RpcError::Decode(_) => errno::EBADMSG,
            RpcError::UnknownCall(_) => errno::ENOENT,
            RpcError::Handler(_) => errno::EREMOTEIO,
            RpcError::NotConnected => errno::ENOTCONN,
            RpcError::ConnectionClosed | RpcError::Io(_) | RpcError::Protocol(_) => {
                errno::ECONNRESET
            }
            RpcError::Timeout | RpcError::BackpressureTimeout => errno::ETIMEDOUT,
            RpcError::Encode(_)
            | RpcError::Config(_)
            | RpcError::Json(_)
            | RpcError::ReplyTaken => errno::EINVAL,
        }
    }
}

/// Error returned by a handler to fail the request it is serving.
///
/// The client sees the call resolve with [`errno::EREMOTEIO`]; the message
/// itself stays in the server log.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    /// Create a handler error with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    /// The failure message.
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<RpcError> for HandlerError {
    fn from(err: RpcError) -> Self {
        Self(err.to_string())
    }
}

impl From<HandlerError> for RpcError {
    fn from(err: HandlerError) -> Self {
        RpcError::Handler(err.0)
    }
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;
