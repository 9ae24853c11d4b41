//! Path utilities for hearth data directories.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Environment variable overriding the data directory.
pub const HOME_ENV: &str = "HEARTH_HOME";

/// Suffix of the temporary file a download writes to.
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Get the hearth data directory (`$HEARTH_HOME`, else `~/.hearth/`).
pub fn hearth_data_dir() -> PathBuf {
    if let Some(home) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .map(|home| home.join(".hearth"))
        .unwrap_or_else(|| PathBuf::from(".hearth"))
}

/// Get the bin directory (`<data>/bin/`).
pub fn bin_dir() -> PathBuf {
    hearth_data_dir().join("bin")
}

/// File name of the llama.cpp server binary.
pub const SERVER_BINARY: &str = if cfg!(target_os = "windows") {
    "llama-server.exe"
} else {
    "llama-server"
};

/// Get the path to the llama-server binary.
pub fn llama_server_path() -> PathBuf {
    bin_dir().join(SERVER_BINARY)
}

/// Directory holding one model's files: `<root>/<model_id>/`.
pub fn model_dir(root: &Path, model_id: &str) -> PathBuf {
    root.join(model_id)
}

/// Temporary sibling a download writes to before the final rename.
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = OsString::from(dest.as_os_str());
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}
