//! Error types for session operations.

use std::time::Duration;

use thiserror::Error;

use hearth_local_ai::LocalAIError;
use hearth_store::StoreError;

/// Errors that can occur while running a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Persisted state could not be read or written.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Model, download or inference server failure.
    #[error(transparent)]
    LocalAI(#[from] LocalAIError),

    /// A store refused the operation because it is busy.
    #[error("{0} store not ready")]
    NotReady(&'static str),

    /// No model has been selected yet.
    #[error("No model selected")]
    NoModelSelected,

    /// The server exited before it became ready.
    #[error("Inference server exited before becoming ready (code: {0:?})")]
    ExitedEarly(Option<i32>),

    /// The server stopped too soon after becoming ready.
    #[error("Inference server stopped {uptime:?} after becoming ready (code: {code:?})")]
    Unstable { uptime: Duration, code: Option<i32> },

    /// The supervisor gave up restarting the server.
    #[error("Inference server for model '{model}' failed {attempts} times in a row: {last}")]
    CrashLoop {
        model: String,
        attempts: u32,
        last: String,
    },

    /// The session was disposed while waiting.
    #[error("Session disposed")]
    Disposed,
}
