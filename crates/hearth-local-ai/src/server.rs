//! Launching and stopping the llama-server process.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::LocalAIError;
use crate::model::EngineSettings;
use crate::paths::llama_server_path;
use crate::template::{PromptTemplate, CHATML_TEMPLATE};
use crate::{DEFAULT_HOST, DEFAULT_PORT};

/// How long a terminated server gets to exit before it is killed.
const KILL_GRACE: Duration = Duration::from_millis(500);

/// Everything needed to start the inference server.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    pub model_path: PathBuf,
    pub prompt_template: String,
    pub ctx_len: u32,
    pub ngl: i32,
    pub cont_batching: bool,
    pub embedding: bool,
    /// `-1` lets the server pick.
    pub cpu_threads: i32,
    pub host: String,
    pub port: u16,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            model_path: PathBuf::new(),
            prompt_template: CHATML_TEMPLATE.to_string(),
            ctx_len: 2048,
            ngl: 32,
            cont_batching: false,
            embedding: false,
            cpu_threads: -1,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl EngineOptions {
    /// These options with a model's own settings laid over them.
    pub fn merged(&self, model_path: impl Into<PathBuf>, settings: &EngineSettings) -> Self {
        Self {
            model_path: model_path.into(),
            prompt_template: settings
                .prompt_template
                .clone()
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| self.prompt_template.clone()),
            ctx_len: settings.ctx_len.unwrap_or(self.ctx_len),
            ngl: settings.ngl.unwrap_or(self.ngl),
            cont_batching: settings.cont_batching.unwrap_or(self.cont_batching),
            embedding: settings.embedding.unwrap_or(self.embedding),
            cpu_threads: settings.cpu_threads.unwrap_or(self.cpu_threads),
            host: self.host.clone(),
            port: self.port,
        }
    }

    /// Base URL of the server's HTTP API.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Command-line arguments for llama-server.
    pub fn args(&self) -> Result<Vec<String>, LocalAIError> {
        let template = PromptTemplate::parse(&self.prompt_template)?;

        let mut args = vec![
            "--model".to_string(),
            self.model_path.display().to_string(),
            "--ctx-size".to_string(),
            self.ctx_len.to_string(),
            "--n-gpu-layers".to_string(),
            self.ngl.to_string(),
        ];
        if self.cont_batching {
            args.push("--cont-batching".to_string());
        }
        if self.embedding {
            args.push("--embedding".to_string());
        }
        if self.cpu_threads != -1 {
            args.push("--threads".to_string());
            args.push(self.cpu_threads.to_string());
        }
        args.extend([
            "--host".to_string(),
            self.host.clone(),
            "--port".to_string(),
            self.port.to_string(),
            "--jinja".to_string(),
            "--chat-template".to_string(),
            template.to_chat_template(),
        ]);
        Ok(args)
    }
}

/// Lifecycle events of a launched server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    /// The process was created.
    Spawned,
    /// The process exited with the given code (`None` if killed by a signal).
    Exited(Option<i32>),
    /// The process is gone and its handles are closed.
    Closed,
    /// The server stopped answering.
    Disconnected,
}

/// Requests termination of a launched server. Killing twice is a no-op.
#[derive(Debug, Clone, Default)]
pub struct KillHandle {
    token: CancellationToken,
}

impl KillHandle {
    pub fn kill(&self) {
        self.token.cancel();
    }

    pub fn is_killed(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// A launched server as seen by its supervisor. Dropping it kills the server.
#[derive(Debug)]
pub struct EngineProcess {
    events: mpsc::UnboundedReceiver<EngineEvent>,
    kill: KillHandle,
}

/// The launcher's side of an [`EngineProcess`]: publishes events and
/// learns about kill requests.
#[derive(Debug, Clone)]
pub struct ProcessDriver {
    events: mpsc::UnboundedSender<EngineEvent>,
    kill: KillHandle,
}

impl EngineProcess {
    /// Create a connected process/driver pair.
    pub fn pair() -> (EngineProcess, ProcessDriver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let kill = KillHandle::default();
        (
            EngineProcess {
                events: rx,
                kill: kill.clone(),
            },
            ProcessDriver { events: tx, kill },
        )
    }

    /// Next lifecycle event; `None` once the driver is gone.
    pub async fn next_event(&mut self) -> Option<EngineEvent> {
        self.events.recv().await
    }

    pub fn kill_handle(&self) -> KillHandle {
        self.kill.clone()
    }

    pub fn kill(&self) {
        self.kill.kill();
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        self.kill.kill();
    }
}

impl ProcessDriver {
    /// Publish an event. Returns `false` if nobody is listening anymore.
    pub fn emit(&self, event: EngineEvent) -> bool {
        self.events.send(event).is_ok()
    }

    /// Resolves once a kill was requested.
    pub async fn killed(&self) {
        self.kill.token.cancelled().await;
    }

    pub fn is_killed(&self) -> bool {
        self.kill.is_killed()
    }
}

/// Starts inference servers.
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    async fn launch(&self, options: &EngineOptions) -> Result<EngineProcess, LocalAIError>;
}

/// Launches the llama.cpp `llama-server` binary.
#[derive(Debug, Clone)]
pub struct LlamaServerLauncher {
    binary: PathBuf,
    kill_grace: Duration,
}

impl LlamaServerLauncher {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            kill_grace: KILL_GRACE,
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Check if the server binary exists.
    pub fn binary_exists(&self) -> bool {
        self.binary.exists()
    }
}

impl Default for LlamaServerLauncher {
    fn default() -> Self {
        Self::new(llama_server_path())
    }
}

#[async_trait]
impl EngineLauncher for LlamaServerLauncher {
    async fn launch(&self, options: &EngineOptions) -> Result<EngineProcess, LocalAIError> {
        if !self.binary_exists() {
            return Err(LocalAIError::ServerBinaryNotFound(
                self.binary.display().to_string(),
            ));
        }
        if !options.model_path.exists() {
            return Err(LocalAIError::ModelNotFound(
                options.model_path.display().to_string(),
            ));
        }

        info!(
            "Starting llama-server on {}:{} with model {:?}",
            options.host, options.port, options.model_path
        );

        let child = Command::new(&self.binary)
            .args(options.args()?)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LocalAIError::ServerStartFailed(e.to_string()))?;

        debug!("llama-server process started with PID: {:?}", child.id());

        let (process, driver) = EngineProcess::pair();
        driver.emit(EngineEvent::Spawned);
        tokio::spawn(reap(child, driver, self.kill_grace));
        Ok(process)
    }
}

/// Wait for the child to exit or be killed, then report it.
async fn reap(mut child: Child, driver: ProcessDriver, grace: Duration) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = driver.killed() => terminate(&mut child, grace).await,
    };

    match status {
        Ok(status) => {
            info!("llama-server exited with status: {}", status);
            driver.emit(EngineEvent::Exited(status.code()));
        }
        Err(e) => {
            warn!("Error waiting for llama-server: {}", e);
            driver.emit(EngineEvent::Exited(None));
        }
    }
    driver.emit(EngineEvent::Closed);
}

/// Graceful shutdown first, then force.
async fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<std::process::ExitStatus> {
    info!("Stopping llama-server (PID: {:?})", child.id());

    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: `pid` belongs to a child we have not reaped yet.
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!("Server didn't exit gracefully, killing...");
            child.kill().await?;
            child.wait().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_args() {
        let options = EngineOptions {
            model_path: PathBuf::from("/models/tiny/tiny.gguf"),
            ..EngineOptions::default()
        };
        let args = options.args().unwrap();
        assert_eq!(
            &args[..6],
            ["--model", "/models/tiny/tiny.gguf", "--ctx-size", "2048", "--n-gpu-layers", "32"]
        );
        assert!(!args.contains(&"--threads".to_string()));
        assert!(!args.contains(&"--cont-batching".to_string()));
        assert!(args.contains(&"--jinja".to_string()));
        assert_eq!(options.base_url(), "http://127.0.0.1:11435");
    }

    #[test]
    fn test_settings_override_defaults() {
        let settings = EngineSettings {
            ctx_len: Some(4096),
            cpu_threads: Some(4),
            cont_batching: Some(true),
            ..EngineSettings::default()
        };
        let options = EngineOptions::default().merged("/m.gguf", &settings);
        assert_eq!(options.ctx_len, 4096);
        assert_eq!(options.ngl, 32);

        let args = options.args().unwrap();
        let threads = args.iter().position(|a| a == "--threads").unwrap();
        assert_eq!(args[threads + 1], "4");
        assert!(args.contains(&"--cont-batching".to_string()));
    }

    #[test]
    fn test_bad_template_fails_args() {
        let options = EngineOptions {
            prompt_template: "no placeholder".to_string(),
            ..EngineOptions::default()
        };
        assert!(matches!(options.args(), Err(LocalAIError::InvalidTemplate(_))));
    }

    #[tokio::test]
    async fn test_pair_delivers_events_and_kill() {
        let (mut process, driver) = EngineProcess::pair();
        assert!(driver.emit(EngineEvent::Spawned));
        assert_eq!(process.next_event().await, Some(EngineEvent::Spawned));

        assert!(!driver.is_killed());
        process.kill();
        process.kill();
        driver.killed().await;
        assert!(process.kill_handle().is_killed());

        drop(driver);
        assert_eq!(process.next_event().await, None);
    }

    #[tokio::test]
    async fn test_dropping_process_requests_kill() {
        let (process, driver) = EngineProcess::pair();
        drop(process);
        assert!(driver.is_killed());
        assert!(!driver.emit(EngineEvent::Closed));
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let launcher = LlamaServerLauncher::new("/nonexistent/llama-server");
        let err = launcher.launch(&EngineOptions::default()).await.unwrap_err();
        assert!(matches!(err, LocalAIError::ServerBinaryNotFound(_)));
    }

    #[tokio::test]
    async fn test_missing_model() {
        let dir = tempdir().unwrap();
        let binary = dir.path().join("llama-server");
        std::fs::write(&binary, "").unwrap();

        let options = EngineOptions {
            model_path: dir.path().join("absent.gguf"),
            ..EngineOptions::default()
        };
        let err = LlamaServerLauncher::new(binary)
            .launch(&options)
            .await
            .unwrap_err();
        assert!(matches!(err, LocalAIError::ModelNotFound(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_real_process_reports_exit() {
        let dir = tempdir().unwrap();
        let model = dir.path().join("tiny.gguf");
        std::fs::write(&model, "gguf").unwrap();

        // `false` ignores its arguments and exits non-zero straight away.
        let Some(binary) = ["/bin/false", "/usr/bin/false"]
            .into_iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
        else {
            return;
        };

        let options = EngineOptions {
            model_path: model,
            ..EngineOptions::default()
        };
        let mut process = LlamaServerLauncher::new(binary)
            .launch(&options)
            .await
            .unwrap();

        assert_eq!(process.next_event().await, Some(EngineEvent::Spawned));
        assert!(matches!(
            process.next_event().await,
            Some(EngineEvent::Exited(Some(code))) if code != 0
        ));
        assert_eq!(process.next_event().await, Some(EngineEvent::Closed));
        assert_eq!(process.next_event().await, None);
    }
}
