//! Error types for mwrpc.
//!
//! Every failure a caller can observe is a variant of [`RpcError`]. Variants are
//! grouped into [`ErrorCategory`] buckets so calling code can branch on the kind
//! of failure (could not reach the server, server said no, job failed, local
//! timeout) without matching on message text.

use crate::context::ContextError;
use crate::envelope::ErrorDescriptor;
use thiserror::Error;

/// errno reported by the backend when the requested object does not exist.
const ENOENT: i64 = 2;

/// Main error type for mwrpc.
#[derive(Debug, Error)]
pub enum RpcError {
    // Connection errors (surfaced from connect only)
    #[error("Failed to reach {address}: {message}")]
    Dial { address: String, message: String },

    #[error("Handshake failed: {message}")]
    Handshake { message: String },

    #[error("Authentication rejected: {message}")]
    AuthenticationRejected { message: String },

    #[error("Invalid endpoint {url}: {message}")]
    InvalidEndpoint { url: String, message: String },

    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // RPC errors
    #[error("{0}")]
    Remote(ErrorDescriptor),

    // Job errors
    #[error("Job submission for {method} failed: {source}")]
    JobSubmit {
        method: String,
        #[source]
        source: Box<RpcError>,
    },

    #[error("Job {id} ({method}) failed: {message}")]
    JobFailed {
        id: i64,
        method: String,
        message: String,
    },

    #[error("Job {id} not found")]
    JobNotFound { id: i64 },

    #[error("Job {id} result could not be decoded: {message}")]
    JobResultDecode {
        id: i64,
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Local errors
    #[error("Context deadline exceeded")]
    DeadlineExceeded,

    #[error("Context cancelled")]
    Cancelled,

    #[error("Not connected")]
    NotConnected,

    #[error("Connection lost: {reason}")]
    ConnectionLost { reason: String },

    #[error("Client closed")]
    Closed,

    #[error("Failed to decode {what}: {message}")]
    Decode {
        what: String,
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Result type alias for mwrpc operations.
pub type Result<T> = std::result::Result<T, RpcError>;

/// Coarse classification of an [`RpcError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Dial, handshake or authentication failures.
    Connection,
    /// The server answered the call with an error descriptor.
    Remote,
    /// A job reached a failed terminal state or could not be tracked.
    Job,
    /// Timeouts, cancellation, missing session, decoding.
    Local,
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Transport {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Decode {
            what: "JSON payload".to_string(),
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<ContextError> for RpcError {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::Cancelled => RpcError::Cancelled,
            ContextError::DeadlineExceeded => RpcError::DeadlineExceeded,
        }
    }
}

impl From<ErrorDescriptor> for RpcError {
    fn from(err: ErrorDescriptor) -> Self {
        RpcError::Remote(err)
    }
}

impl RpcError {
    /// Create a decode error for a named payload.
    pub fn decode(what: impl Into<String>, err: serde_json::Error) -> Self {
        RpcError::Decode {
            what: what.into(),
            message: err.to_string(),
            source: Some(err),
        }
    }

    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        RpcError::Protocol {
            message: message.into(),
        }
    }

    /// Which bucket this error belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            RpcError::Dial { .. }
            | RpcError::Handshake { .. }
            | RpcError::AuthenticationRejected { .. }
            | RpcError::InvalidEndpoint { .. }
            | RpcError::Transport { .. } => ErrorCategory::Connection,

            RpcError::Remote(_) => ErrorCategory::Remote,

            RpcError::JobSubmit { .. }
            | RpcError::JobFailed { .. }
            | RpcError::JobNotFound { .. }
            | RpcError::JobResultDecode { .. } => ErrorCategory::Job,

            RpcError::DeadlineExceeded
            | RpcError::Cancelled
            | RpcError::NotConnected
            | RpcError::ConnectionLost { .. }
            | RpcError::Closed
            | RpcError::Decode { .. }
            | RpcError::Protocol { .. }
            | RpcError::Config { .. } => ErrorCategory::Local,
        }
    }

    /// Check if this error is transient, so a retry may succeed.
    ///
    /// mwrpc never retries calls on its own; this is for callers and for the
    /// reconnector deciding whether another connection attempt is worthwhile.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RpcError::Dial { .. }
                | RpcError::Handshake { .. }
                | RpcError::Transport { .. }
                | RpcError::DeadlineExceeded
                | RpcError::NotConnected
                | RpcError::ConnectionLost { .. }
        )
    }

    /// Check if the server reported that the target object does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            RpcError::Remote(desc) => desc.code == ENOENT,
            RpcError::JobNotFound { .. } => true,
            RpcError::JobSubmit { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// The server-side error descriptor, if this error carries one.
    pub fn remote(&self) -> Option<&ErrorDescriptor> {
        match self {
            RpcError::Remote(desc) => Some(desc),
            RpcError::JobSubmit { source, .. } => source.remote(),
            _ => None,
        }
    }
}
