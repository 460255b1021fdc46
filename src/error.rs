//! Error types for agentlink.

use std::fmt;

use thiserror::Error;

/// Result type alias for agentlink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Why an agent stopped operating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationCause {
    /// The configured kill date was reached
    KillDate,
    /// `MaxRetry` consecutive failures
    RetriesExhausted,
    /// A verified terminate directive, or local cancellation
    Commanded,
    /// A non-retryable error (e.g. invalid configuration)
    Fatal,
}

impl fmt::Display for TerminationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cause = match self {
            TerminationCause::KillDate => "kill date reached",
            TerminationCause::RetriesExhausted => "retry budget exhausted",
            TerminationCause::Commanded => "terminate requested",
            TerminationCause::Fatal => "fatal error",
        };
        f.write_str(cause)
    }
}

/// Coarse error classes used by the session to pick retry vs. termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid or incompatible configuration; never retried
    Config,
    /// PAKE failure or server-side rejection; retried with a fresh attempt
    Auth,
    /// Network, DNS, proxy or timeout failure; always retryable
    Transport,
    /// Envelope integrity or decryption failure; retryable, never downgraded
    Crypto,
    /// The agent has terminated
    Fatal,
}

/// Errors that can occur during agentlink operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Authentication (OPAQUE) failed
    #[error("authentication failed: {0}")]
    Auth(String),

    /// No session key is available for sealing
    #[error("session is not authenticated")]
    NotAuthenticated,

    /// The server answered with a non-success HTTP status
    #[error("server rejected request with status {0}")]
    Rejected(u16),

    /// Transport-level failure (connect, proxy, TLS, HTTP framing)
    #[error("transport error: {0}")]
    Transport(String),

    /// Request timeout
    #[error("request timed out after {0}ms")]
    Timeout(u64),

    /// Envelope failed verification. The cause is deliberately not exposed.
    #[error("envelope rejected")]
    Crypto,

    /// Invalid message format
    #[error("invalid message format: {0}")]
    InvalidMessage(String),

    /// Buffer overflow/underflow
    #[error("buffer error: expected {expected} bytes, got {actual}")]
    Buffer { expected: usize, actual: usize },

    /// Protocol version mismatch
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u8, actual: u8 },

    /// Payload (de)serialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Local I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The agent has terminated and will not touch the network again
    #[error("agent terminated: {0}")]
    Terminated(TerminationCause),
}

impl Error {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new authentication error
    pub fn auth(msg: impl Into<String>) -> Self {
        Error::Auth(msg.into())
    }

    /// Create a new transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Config,
            Error::Auth(_) | Error::NotAuthenticated | Error::Rejected(_) => ErrorKind::Auth,
            Error::Transport(_) | Error::Timeout(_) | Error::Io(_) => ErrorKind::Transport,
            Error::Crypto
            | Error::InvalidMessage(_)
            | Error::Buffer { .. }
            | Error::VersionMismatch { .. }
            | Error::Serialization(_) => ErrorKind::Crypto,
            Error::Terminated(_) => ErrorKind::Fatal,
        }
    }

    /// Check if the session may retry after this error
    pub fn is_retryable(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Config | ErrorKind::Fatal)
    }

    /// Check if this error means the current session key must be discarded
    pub fn invalidates_session(&self) -> bool {
        matches!(self.kind(), ErrorKind::Auth | ErrorKind::Crypto)
    }
}
