//! Test doubles shared by the supervisor and session tests.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hearth_local_ai::{
    EngineEvent, EngineLauncher, EngineOptions, EngineProcess, LocalAIError, ModelDescriptor,
    ProcessDriver,
};
use serde_json::json;
use tokio::sync::mpsc;

use crate::settings::SupervisorConfig;

/// Upper bound for anything a test waits on.
pub(crate) const TIMEOUT: Duration = Duration::from_secs(5);

/// A launcher whose processes are driven by the test.
///
/// Every launched process reports `Spawned` straight away, and answers a
/// kill request with `Exited(None)` followed by `Closed`. The test receives
/// a driver per launch to inject further events.
pub(crate) struct ScriptedLauncher {
    launches: Mutex<Vec<EngineOptions>>,
    drivers: mpsc::UnboundedSender<ProcessDriver>,
    failing: AtomicBool,
}

impl ScriptedLauncher {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ProcessDriver>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let launcher = Arc::new(Self {
            launches: Mutex::new(Vec::new()),
            drivers: tx,
            failing: AtomicBool::new(false),
        });
        (launcher, rx)
    }

    pub(crate) fn launches(&self) -> Vec<EngineOptions> {
        self.launches.lock().unwrap().clone()
    }

    pub(crate) fn launch_count(&self) -> usize {
        self.launches.lock().unwrap().len()
    }

    /// Make every further launch fail.
    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl EngineLauncher for ScriptedLauncher {
    async fn launch(&self, options: &EngineOptions) -> Result<EngineProcess, LocalAIError> {
        self.launches.lock().unwrap().push(options.clone());
        if self.failing.load(Ordering::SeqCst) {
            return Err(LocalAIError::ServerStartFailed("scripted failure".to_string()));
        }

        let (process, driver) = EngineProcess::pair();
        driver.emit(EngineEvent::Spawned);

        let responder = driver.clone();
        tokio::spawn(async move {
            responder.killed().await;
            responder.emit(EngineEvent::Exited(None));
            responder.emit(EngineEvent::Closed);
        });

        let _ = self.drivers.send(driver);
        Ok(process)
    }
}

/// A descriptor for `<id>.gguf`, with a custom context length.
pub(crate) fn descriptor(id: &str) -> ModelDescriptor {
    serde_json::from_value(json!({
        "id": id,
        "name": format!("Test {id}"),
        "sources": [{
            "url": format!("http://127.0.0.1:9/{id}.gguf"),
            "filename": format!("{id}.gguf"),
        }],
        "settings": { "ctx_len": 1024 },
        "parameters": { "temperature": 0.3 },
    }))
    .unwrap()
}

/// Write a model's descriptor to `catalog` and its artifact under `models`.
pub(crate) fn install_model(catalog: &Path, models: &Path, model: &ModelDescriptor) {
    std::fs::create_dir_all(catalog).unwrap();
    std::fs::write(
        catalog.join(format!("{}.json", model.id)),
        serde_json::to_string(model).unwrap(),
    )
    .unwrap();

    let artifact = model.artifact_path(models).unwrap();
    std::fs::create_dir_all(artifact.parent().unwrap()).unwrap();
    std::fs::write(artifact, "gguf").unwrap();
}

/// Supervisor settings with short delays and no health check. Any run
/// that reached ready counts as stable.
pub(crate) fn fast_supervisor_config() -> SupervisorConfig {
    SupervisorConfig {
        settle_delay: Duration::from_millis(20),
        health_interval: None,
        restart_delay: Duration::from_millis(10),
        max_backoff: Duration::from_millis(40),
        max_restarts: 3,
        stable_after: Duration::ZERO,
        ..SupervisorConfig::default()
    }
}
