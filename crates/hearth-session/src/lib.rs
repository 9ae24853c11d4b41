//! Hearth session: the chat stores, the inference process supervisor and
//! the context that wires them together.
//!
//! ```text
//! ChatConfigStore ──┐
//! ChatHistoryStore ─┼── ReadinessGate ("busy")
//! ProcessSupervisor ┘        ▲
//!        │ watches           │
//!        ▼                   │
//! ModelSelectionStore ── ModelRegistry
//! ```

mod config;
mod error;
mod history;
mod session;
mod settings;
mod supervisor;

#[cfg(test)]
mod testing;

pub use config::{ChatConfig, ChatConfigPatch, ChatConfigStore, CHAT_CONFIG_KEY};
pub use error::SessionError;
pub use history::{ChatHistoryStore, CHAT_HISTORY_KEY, SYSTEM_PROMPT};
pub use session::Session;
pub use settings::{SessionSettings, SessionSettingsBuilder, SupervisorConfig};
pub use supervisor::{ProcessState, ProcessStatus, ProcessSupervisor};

/// Re-exported so callers can drive store lifecycles without a direct dependency.
pub use hearth_store::Resource;
