//! Local model management and inference backend for hearth.
//!
//! This crate owns everything that touches model files and the llama.cpp
//! server: downloading artifacts, keeping the catalog of descriptors in
//! sync with disk, remembering which model is selected, launching the
//! server process and talking to its completion API.

mod client;
mod download;
mod error;
mod model;
pub mod paths;
mod registry;
mod selection;
mod server;
mod template;

pub use client::{ChatMessage, CompletionClient, CompletionRequest, Role};
pub use download::{
    CancelSignal, Download, DownloadPipeline, DownloadProgress, ProgressSender,
    DEFAULT_CLOSE_GRACE, DEFAULT_UNLINK_GRACE,
};
pub use error::LocalAIError;
pub use model::{DownloadSource, EngineSettings, ModelDescriptor, SamplingParameters};
pub use registry::ModelRegistry;
pub use selection::{ModelDownload, ModelSelectionStore, SELECTED_MODEL_KEY};
pub use server::{
    EngineEvent, EngineLauncher, EngineOptions, EngineProcess, KillHandle, LlamaServerLauncher,
    ProcessDriver,
};
pub use template::{PromptTemplate, CHATML_TEMPLATE};

/// Default port for the local llama-server instance.
pub const DEFAULT_PORT: u16 = 11435;

/// Default host the server binds to.
pub const DEFAULT_HOST: &str = "127.0.0.1";
