//! Common error types for TarotSync.

use thiserror::Error;

/// A single record that could not be pushed during a migration pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFailure {
    /// Record kind ("session" or "spread").
    pub kind: &'static str,
    /// Identity key of the record (date for sessions, id for spreads).
    pub key: String,
    /// Rendered error that caused the failure.
    pub reason: String,
}

/// Top-level error type for TarotSync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The network could not be reached or the request timed out.
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    /// Credentials are missing or invalid and could not be refreshed.
    #[error("Authentication required: {0}")]
    AuthenticationRequired(String),

    /// Login or registration was rejected by the server.
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// The server answered with a non-success status.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// The server rejected a storage operation.
    #[error("Remote rejected request ({status}): {message}")]
    RemoteRejected { status: u16, message: String },

    /// A server payload could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// One or more records failed to migrate.
    #[error("Migration partially failed: {} record(s)", .0.len())]
    MigrationPartialFailure(Vec<MigrationFailure>),

    /// An offline operation was dropped because an earlier one failed.
    #[error("Queued operation aborted: {0}")]
    QueueAborted(String),

    /// Local storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),
}

impl Error {
    /// Whether the failure is expected to clear up once connectivity returns.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::NetworkUnavailable(_))
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Http { status, .. } | Error::RemoteRejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
