//! Error types for local AI operations.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during local AI operations.
#[derive(Debug, Error)]
pub enum LocalAIError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Server returned an error response.
    #[error("API error: {0}")]
    Api(String),

    /// Server is not running or not reachable.
    #[error("Server not running at {0}")]
    ServerNotRunning(String),

    /// Server failed to start.
    #[error("Failed to start server: {0}")]
    ServerStartFailed(String),

    /// llama-server binary not found.
    #[error("llama-server binary not found at {0}")]
    ServerBinaryNotFound(String),

    /// Model not found locally.
    #[error("Model '{0}' not found")]
    ModelNotFound(String),

    /// Model is not downloaded, so there is nothing to remove or run.
    #[error("Model with id <{0}> is not yet downloaded")]
    NotDownloaded(String),

    /// The registry reported a model as present but its files are gone.
    #[error("[Fatal error]: model for id <{0}> not found on disk, registry is out of sync")]
    RegistryDesync(String),

    /// A prompt template lacks the `{prompt}` placeholder.
    #[error("Invalid prompt template: {0}")]
    InvalidTemplate(String),

    /// A descriptor file could not be parsed.
    #[error("Invalid model descriptor {path}: {message}")]
    InvalidDescriptor { path: PathBuf, message: String },

    /// Remote host answered with a status other than 200/302.
    #[error("Download failed: {status} - {message}")]
    DownloadFailed { status: u16, message: String },

    /// A redirect did not carry a usable `Location` header.
    #[error("Invalid redirect from {0}")]
    BadRedirect(String),

    /// Download was cancelled by the caller.
    #[error("Download cancelled")]
    Cancelled,

    /// Checksum verification failed.
    #[error("Model checksum mismatch. Expected: {expected}, got: {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Persisted state could not be read or written.
    #[error("Storage error: {0}")]
    Storage(#[from] hearth_store::StoreError),

    /// A background task panicked or was aborted.
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
