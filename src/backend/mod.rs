//! Concrete [`crate::engine::loader::SubsetLoader`] backends.

/// In-memory collection.
pub mod memory;
/// SQLite-backed collection.
pub mod sqlite;

use thiserror::Error;

use crate::engine::loader::LoadError;

/// Errors raised by backend collections.
#[derive(Debug, Error)]
pub enum BackendError {
    /// SQLite failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Payload encoding failure.
    #[error("payload encoding error: {0}")]
    Serde(#[from] serde_json::Error),
    /// Item has no identity under the backend's identity extractor.
    #[error("item has no identity at `{0}`")]
    MissingIdentity(String),
    /// Predicate or option the backend cannot express.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// Any other failure.
    #[error("{0}")]
    Message(String),
}

impl From<BackendError> for LoadError {
    fn from(value: BackendError) -> Self {
        Self::Backend(value.to_string())
    }
}

/// Result alias for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;
