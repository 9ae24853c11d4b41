//! Error types for store operations.

use thiserror::Error;

/// Errors that can occur while operating a store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store is busy and refused the operation.
    #[error("{0} store not ready")]
    NotReady(&'static str),

    /// Reading or writing persisted state failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted state could not be (de)serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A key contained characters that cannot be used as a file name.
    #[error("invalid storage key: {0:?}")]
    InvalidKey(String),
}
