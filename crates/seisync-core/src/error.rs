//! Error types for seisync.

use thiserror::Error;

/// Result type alias using seisync's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures that abort a run.
///
/// Per-item API failures are recorded on the item's status row and never
/// surface as this type; see `seisync_client::ApiError` for those.
#[derive(Error, Debug)]
pub enum Error {
    #[error("state store error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("not found: {0}")]
    NotFound(String),

    /// Object storage write, read or health check failed.
    #[error("object storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// Missing or inconsistent settings, detected before any work starts.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The SEI API rejected the service credentials.
    #[error("SEI login rejected: {0}")]
    Auth(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Short label for logs and the CLI report.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Database(_) => "database",
            Error::NotFound(_) => "not_found",
            Error::Storage(_) | Error::Io(_) => "storage",
            Error::Serialization(_) => "serialization",
            Error::Config(_) => "config",
            Error::InvalidInput(_) => "invalid_input",
            Error::Auth(_) => "auth",
            Error::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
