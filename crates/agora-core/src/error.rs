//! Error types for the agora-core crate

use thiserror::Error;

/// Result type alias using `CoreError`
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur in sync, buffer, and audit operations
#[derive(Error, Debug)]
pub enum CoreError {
    /// Hash or manifest mismatch. Always fatal; never auto-corrected.
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    /// A non-rotatable buffer is at capacity
    #[error("buffer full: {role} holds {max_size} entries")]
    BufferFull { role: String, max_size: usize },

    /// Stored object has an unknown kind
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// All backup paths, including the local-disk fallback, are exhausted
    #[error("backup failed: {0}")]
    BackupFailed(String),

    /// Unknown buffer role name
    #[error("unknown buffer role: {0}")]
    UnknownRole(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Content store error (including missing content ids)
    #[error("content store error: {0}")]
    Store(#[from] agora_store::StoreError),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}
