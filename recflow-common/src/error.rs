//! Common error types for recflow

use thiserror::Error;

/// Common result type for recflow operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy shared by the repository, engine and harvest boundary
#[derive(Error, Debug)]
pub enum Error {
    /// Persistence failure (wraps sqlx::Error). Never retried by the repository.
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed directive, matcher, rule or settings configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// A service transform failed for one record
    #[error("Failed to process record {oai_id}: {message}")]
    RecordProcessing { oai_id: String, message: String },

    /// Harvest collaborator did not answer in time
    #[error("Timed out after {0} ms")]
    Timeout(u64),

    /// Service already has an active run
    #[error("Service already running: {0}")]
    AlreadyRunning(String),

    /// Requested entity not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid caller input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// JSON (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a per-record processing error
    pub fn record(oai_id: impl Into<String>, message: impl Into<String>) -> Self {
        Error::RecordProcessing {
            oai_id: oai_id.into(),
            message: message.into(),
        }
    }

    /// True when SQLite reported lock contention rather than a real failure
    pub fn is_lock_contention(&self) -> bool {
        match self {
            Error::Storage(db_err) => {
                let msg = db_err.to_string();
                msg.contains("database is locked") || msg.contains("database table is locked")
            }
            _ => false,
        }
    }
}
