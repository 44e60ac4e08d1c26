//! Error type shared by every part of the transport.

use thiserror::Error;

/// Numeric error class carried by every transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Initial handshake or protocol negotiation failed.
    HandShakeFailed,
    /// The server rejected or garbled the login exchange.
    LoginFailed,
    /// No authentication mechanism could be negotiated.
    AuthFailed,
    /// A message body does not have the shape its header announces.
    InvalidMessage,
    /// A message is well formed but its content is inconsistent.
    DataError,
    /// A response is overdue on an otherwise idle stream.
    SocketTimeout,
    /// Socket-level failure reported by the collaborator.
    SocketError,
    /// Internal bookkeeping inconsistency.
    Internal,
    /// The channel query is not known.
    QueryNotSupported,
    /// The operation is not supported for this message.
    NotSupported,
    /// The operation is invalid in the current state.
    InvalidOp,
}

impl ErrorCode {
    /// Short symbolic name used in log lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::HandShakeFailed => "errHandShakeFailed",
            ErrorCode::LoginFailed => "errLoginFailed",
            ErrorCode::AuthFailed => "errAuthFailed",
            ErrorCode::InvalidMessage => "errInvalidMessage",
            ErrorCode::DataError => "errDataError",
            ErrorCode::SocketTimeout => "errSocketTimeout",
            ErrorCode::SocketError => "errSocketError",
            ErrorCode::Internal => "errInternal",
            ErrorCode::QueryNotSupported => "errQueryNotSupported",
            ErrorCode::NotSupported => "errNotSupported",
            ErrorCode::InvalidOp => "errInvalidOp",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the failing sub-stream survives the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Per-message failure; the stream stays usable.
    Error,
    /// The stream is broken and must be re-established by the caller.
    Fatal,
}

/// Every failure the transport reports.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Handshake or protocol negotiation failed.
    #[error("hand shake failed: {reason}")]
    HandShakeFailed { reason: String },

    /// Login or bind was rejected.
    #[error("login failed: {reason}")]
    LoginFailed { reason: String },

    /// No mechanism was accepted.
    #[error("authentication failed: {reason}")]
    AuthFailed { reason: String },

    /// Message too short or inconsistent with its header.
    #[error("invalid message: {reason}")]
    InvalidMessage { reason: String },

    /// Well formed message with unusable content.
    #[error("data error: {reason}")]
    DataError { reason: String },

    /// No traffic within the allowed time.
    #[error("stream {stream} timed out after {timeout_secs}s with responses outstanding")]
    SocketTimeout { stream: String, timeout_secs: u64 },

    /// Bookkeeping inconsistency.
    #[error("internal error: {reason}")]
    Internal { reason: String },

    /// Unknown channel query code.
    #[error("query {0} not supported")]
    QueryNotSupported(u16),

    /// Step not valid in the current state; nothing changed.
    #[error("invalid operation: {reason}")]
    InvalidOp { reason: String },

    /// All stream ids are in use.
    #[error("stream ids exhausted ({allocated} in use)")]
    StreamIdsExhausted { allocated: usize },

    /// Body above the size limit.
    #[error("payload too large: {size} bytes (max {max_size})")]
    PayloadTooLarge { size: u32, max_size: u32 },

    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),

    /// Socket level failure.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl TransportError {
    /// Error class of this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            TransportError::HandShakeFailed { .. } => ErrorCode::HandShakeFailed,
            TransportError::LoginFailed { .. } => ErrorCode::LoginFailed,
            TransportError::AuthFailed { .. } => ErrorCode::AuthFailed,
            TransportError::InvalidMessage { .. } => ErrorCode::InvalidMessage,
            TransportError::DataError { .. } => ErrorCode::DataError,
            TransportError::SocketTimeout { .. } => ErrorCode::SocketTimeout,
            TransportError::Internal { .. } => ErrorCode::Internal,
            TransportError::QueryNotSupported(_) => ErrorCode::QueryNotSupported,
            TransportError::InvalidOp { .. } => ErrorCode::InvalidOp,
            TransportError::StreamIdsExhausted { .. } => ErrorCode::Internal,
            TransportError::PayloadTooLarge { .. } => ErrorCode::InvalidMessage,
            TransportError::Config(_) => ErrorCode::InvalidOp,
            TransportError::IoError(_) => ErrorCode::SocketError,
        }
    }

    /// Severity of this failure.
    pub fn severity(&self) -> Severity {
        match self {
            TransportError::HandShakeFailed { .. }
            | TransportError::LoginFailed { .. }
            | TransportError::AuthFailed { .. }
            | TransportError::Internal { .. }
            | TransportError::IoError(_) => Severity::Fatal,
            _ => Severity::Error,
        }
    }

    /// True when the failing stream must be marked broken.
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TransportError>;
