//! Building blocks shared by every stateful component in hearth.
//!
//! A [`ResourceStore`] holds one authoritative value, a set of named
//! [`Readiness`] flags and the background tasks it spawned while
//! initializing. Flags double as admission gates: a store that is busy
//! publishes `false` and callers either queue ([`Readiness::acquire`]) or
//! are turned away ([`Readiness::try_acquire`]).
//!
//! ```text
//!   config.ready ──┐
//!  history.ready ──┼──► ReadinessGate (AND) ──► busy / ready
//!  process.ready ──┘
//! ```
//!
//! Durable state goes through the [`KeyValueStore`] boundary.

mod error;
mod readiness;
mod storage;
mod store;

pub use error::StoreError;
pub use readiness::{Readiness, ReadinessGate, ReadyGuard};
pub use storage::{load_json, save_json, JsonFileStore, KeyValueStore, MemoryStore};
pub use store::{Resource, ResourceStore, Subscriptions};

/// Name of the readiness flag every store carries.
pub const READY: &str = "ready";
