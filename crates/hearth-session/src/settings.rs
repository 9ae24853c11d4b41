//! Session and supervisor settings.

use std::path::PathBuf;
use std::time::Duration;

use hearth_local_ai::paths::{self, HOME_ENV};
use hearth_local_ai::EngineOptions;

/// Tunables of the process supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Path to the llama-server binary.
    pub server_binary: PathBuf,
    /// Defaults a model's own settings are laid over; also host and port.
    pub engine: EngineOptions,
    /// Wait between spawn and ready.
    pub settle_delay: Duration,
    /// Health probe period while ready. `None` disables probing.
    pub health_interval: Option<Duration>,
    /// Delay before the first retry after a failed start.
    pub restart_delay: Duration,
    /// Upper bound of the exponential retry delay.
    pub max_backoff: Duration,
    /// Consecutive failed starts before giving up. `0` retries forever.
    pub max_restarts: u32,
    /// A server that stops sooner than this after becoming ready counts
    /// as a failed start.
    pub stable_after: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            server_binary: paths::llama_server_path(),
            engine: EngineOptions::default(),
            settle_delay: Duration::from_millis(500),
            health_interval: Some(Duration::from_secs(10)),
            restart_delay: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_restarts: 5,
            stable_after: Duration::from_secs(10),
        }
    }
}

impl SupervisorConfig {
    /// Delay before start attempt number `failures + 1`.
    pub fn backoff(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32 << (failures - 1).min(16);
        self.restart_delay
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Everything a [`Session`](crate::Session) needs to know.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Data root (`~/.hearth`).
    pub data_dir: PathBuf,
    /// One directory per model.
    pub models_dir: PathBuf,
    /// Model descriptor files.
    pub catalog_dir: PathBuf,
    /// Persisted key/value state.
    pub state_dir: PathBuf,
    pub supervisor: SupervisorConfig,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::with_data_dir(paths::hearth_data_dir())
    }
}

impl SessionSettings {
    /// Default settings with every directory under `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            models_dir: data_dir.join("models"),
            catalog_dir: data_dir.join("catalog"),
            state_dir: data_dir.join("state"),
            supervisor: SupervisorConfig {
                server_binary: data_dir.join("bin").join(paths::SERVER_BINARY),
                ..SupervisorConfig::default()
            },
            data_dir,
        }
    }

    /// Create settings from environment variables.
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut settings = match var(HOME_ENV).filter(|v| !v.is_empty()) {
            Some(home) => Self::with_data_dir(home),
            None => Self::default(),
        };
        let supervisor = &mut settings.supervisor;

        if let Some(port) = var("HEARTH_PORT").and_then(|v| v.parse().ok()) {
            supervisor.engine.port = port;
        }
        if let Some(bin) = var("HEARTH_SERVER_BIN").filter(|v| !v.is_empty()) {
            supervisor.server_binary = PathBuf::from(bin);
        }
        if let Some(ms) = var("HEARTH_SETTLE_MS").and_then(|v| v.parse().ok()) {
            supervisor.settle_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = var("HEARTH_HEALTH_INTERVAL_MS").and_then(|v| v.parse::<u64>().ok()) {
            supervisor.health_interval = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(max) = var("HEARTH_MAX_RESTARTS").and_then(|v| v.parse().ok()) {
            supervisor.max_restarts = max;
        }
        if let Some(ms) = var("HEARTH_STABLE_AFTER_MS").and_then(|v| v.parse().ok()) {
            supervisor.stable_after = Duration::from_millis(ms);
        }

        settings
    }

    /// Base URL of the supervised server's HTTP API.
    pub fn completion_url(&self) -> String {
        self.supervisor.engine.base_url()
    }

    /// Create a builder for settings.
    pub fn builder() -> SessionSettingsBuilder {
        SessionSettingsBuilder::default()
    }
}

/// Builder for session settings.
#[derive(Debug, Default)]
pub struct SessionSettingsBuilder {
    settings: SessionSettings,
}

impl SessionSettingsBuilder {
    /// Move every directory under `dir`, keeping other settings.
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        let default_binary = self.settings.data_dir.join("bin").join(paths::SERVER_BINARY);
        let mut supervisor = self.settings.supervisor.clone();
        let relocated = SessionSettings::with_data_dir(dir);
        if supervisor.server_binary == default_binary {
            supervisor.server_binary = relocated.supervisor.server_binary.clone();
        }
        self.settings = SessionSettings {
            supervisor,
            ..relocated
        };
        self
    }

    pub fn models_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.settings.models_dir = dir.into();
        self
    }

    pub fn catalog_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.settings.catalog_dir = dir.into();
        self
    }

    pub fn state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.settings.state_dir = dir.into();
        self
    }

    pub fn server_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings.supervisor.server_binary = path.into();
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.settings.supervisor.engine.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.settings.supervisor.engine.port = port;
        self
    }

    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.settings.supervisor.settle_delay = delay;
        self
    }

    pub fn health_interval(mut self, interval: Option<Duration>) -> Self {
        self.settings.supervisor.health_interval = interval;
        self
    }

    pub fn restart_delay(mut self, delay: Duration) -> Self {
        self.settings.supervisor.restart_delay = delay;
        self
    }

    pub fn max_backoff(mut self, delay: Duration) -> Self {
        self.settings.supervisor.max_backoff = delay;
        self
    }

    pub fn max_restarts(mut self, max: u32) -> Self {
        self.settings.supervisor.max_restarts = max;
        self
    }

    pub fn stable_after(mut self, uptime: Duration) -> Self {
        self.settings.supervisor.stable_after = uptime;
        self
    }

    /// Replace the default engine options (context length, GPU layers, ...).
    pub fn engine(mut self, engine: EngineOptions) -> Self {
        self.settings.supervisor.engine = engine;
        self
    }

    pub fn build(self) -> SessionSettings {
        self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_layout_follows_data_dir() {
        let settings = SessionSettings::with_data_dir("/data/hearth");
        assert_eq!(settings.models_dir, PathBuf::from("/data/hearth/models"));
        assert_eq!(settings.catalog_dir, PathBuf::from("/data/hearth/catalog"));
        assert_eq!(settings.state_dir, PathBuf::from("/data/hearth/state"));
        assert!(settings
            .supervisor
            .server_binary
            .starts_with("/data/hearth/bin"));
        assert_eq!(settings.completion_url(), "http://127.0.0.1:11435");
    }

    #[test]
    fn test_from_vars() {
        let settings = SessionSettings::from_vars(vars(&[
            ("HEARTH_HOME", "/tmp/h"),
            ("HEARTH_PORT", "9000"),
            ("HEARTH_SERVER_BIN", "/opt/llama-server"),
            ("HEARTH_SETTLE_MS", "50"),
            ("HEARTH_HEALTH_INTERVAL_MS", "0"),
            ("HEARTH_MAX_RESTARTS", "2"),
            ("HEARTH_STABLE_AFTER_MS", "1500"),
        ]));
        assert_eq!(settings.models_dir, PathBuf::from("/tmp/h/models"));
        assert_eq!(settings.supervisor.engine.port, 9000);
        assert_eq!(
            settings.supervisor.server_binary,
            PathBuf::from("/opt/llama-server")
        );
        assert_eq!(settings.supervisor.settle_delay, Duration::from_millis(50));
        assert_eq!(settings.supervisor.health_interval, None);
        assert_eq!(settings.supervisor.max_restarts, 2);
        assert_eq!(settings.supervisor.stable_after, Duration::from_millis(1500));
    }

    #[test]
    fn test_unparseable_vars_keep_defaults() {
        let settings = SessionSettings::from_vars(vars(&[
            ("HEARTH_HOME", "/tmp/h"),
            ("HEARTH_PORT", "not-a-port"),
        ]));
        assert_eq!(settings.supervisor.engine.port, 11435);
        assert_eq!(settings.supervisor.max_restarts, 5);
    }

    #[test]
    fn test_builder() {
        let settings = SessionSettings::builder()
            .max_restarts(9)
            .data_dir("/srv/hearth")
            .port(8080)
            .settle_delay(Duration::from_millis(5))
            .build();
        assert_eq!(settings.catalog_dir, PathBuf::from("/srv/hearth/catalog"));
        assert_eq!(settings.supervisor.max_restarts, 9);
        assert_eq!(settings.completion_url(), "http://127.0.0.1:8080");
        assert!(settings.supervisor.server_binary.starts_with("/srv/hearth/bin"));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = SupervisorConfig {
            restart_delay: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            ..SupervisorConfig::default()
        };
        assert_eq!(config.backoff(0), Duration::ZERO);
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(3), Duration::from_millis(350));
        assert_eq!(config.backoff(40), Duration::from_millis(350));
    }
}
