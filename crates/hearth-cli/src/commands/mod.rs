//! CLI commands.

pub mod chat;
pub mod info;
pub mod model;

use hearth_session::{Session, SessionSettings};

/// Build a session, mapping construction errors into reports.
pub(crate) fn open_session(settings: SessionSettings) -> miette::Result<Session> {
    Session::new(settings).map_err(|e| miette::miette!("Failed to open session: {}", e))
}
