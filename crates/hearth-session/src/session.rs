//! The session context: every store of one hearth instance, wired together.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use hearth_local_ai::{
    CompletionClient, DownloadPipeline, EngineLauncher, LlamaServerLauncher, ModelRegistry,
    ModelSelectionStore,
};
use hearth_store::{JsonFileStore, KeyValueStore, Readiness, ReadinessGate, Resource};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ChatConfigStore;
use crate::error::SessionError;
use crate::history::ChatHistoryStore;
use crate::settings::SessionSettings;
use crate::supervisor::ProcessSupervisor;

/// Owns the store graph of one session.
///
/// Nothing runs until [`init`](Self::init); [`dispose`](Self::dispose)
/// tears everything down again and may be called any number of times.
pub struct Session {
    settings: SessionSettings,
    chat_config: Arc<ChatConfigStore>,
    history: Arc<ChatHistoryStore>,
    selection: ModelSelectionStore,
    registry: ModelRegistry,
    supervisor: ProcessSupervisor,
    gate: Mutex<Option<ReadinessGate>>,
    /// Cancelled by dispose; re-armed by init.
    shutdown: Mutex<CancellationToken>,
    live: AtomicBool,
}

impl Session {
    /// A session persisting to `settings.state_dir` and running the
    /// llama.cpp server binary.
    pub fn new(settings: SessionSettings) -> Result<Self, SessionError> {
        let storage = Arc::new(JsonFileStore::new(&settings.state_dir));
        let launcher = Arc::new(LlamaServerLauncher::new(
            &settings.supervisor.server_binary,
        ));
        Self::with_parts(settings, storage, launcher)
    }

    /// A session over caller-provided storage and launcher.
    pub fn with_parts(
        settings: SessionSettings,
        storage: Arc<dyn KeyValueStore>,
        launcher: Arc<dyn EngineLauncher>,
    ) -> Result<Self, SessionError> {
        let pipeline = DownloadPipeline::new()?;
        let chat_config = Arc::new(ChatConfigStore::new(storage.clone()));
        let selection = ModelSelectionStore::new(storage.clone(), pipeline, &settings.models_dir);
        let registry = ModelRegistry::new(&settings.catalog_dir, selection.clone());
        let history = Arc::new(ChatHistoryStore::new(
            storage,
            CompletionClient::with_url(settings.completion_url()),
            chat_config.clone(),
            selection.clone(),
        ));
        let supervisor = ProcessSupervisor::new(
            settings.supervisor.clone(),
            launcher,
            selection.clone(),
            registry.clone(),
            history.clone(),
            chat_config.clone(),
        );

        Ok(Self {
            settings,
            chat_config,
            history,
            selection,
            registry,
            supervisor,
            gate: Mutex::new(None),
            shutdown: Mutex::new(CancellationToken::new()),
            live: AtomicBool::new(false),
        })
    }

    /// Initialize every store in dependency order and start supervising
    /// the inference server. A disposed session may be initialized again.
    pub async fn init(&self) -> Result<(), SessionError> {
        *self.shutdown.lock().unwrap_or_else(PoisonError::into_inner) = CancellationToken::new();
        info!("Starting session in {:?}", self.settings.data_dir);

        self.chat_config.init().await?;
        self.history.init().await?;
        self.init_models().await?;
        self.supervisor.init().await?;

        let gate = ReadinessGate::all(
            "session",
            [
                self.chat_config.readiness(),
                self.history.readiness(),
                self.supervisor.readiness(),
            ],
        );
        *self.gate.lock().unwrap_or_else(PoisonError::into_inner) = Some(gate);
        debug!("Session initialized");
        Ok(())
    }

    /// Initialize only the model stores, without starting a server.
    pub async fn init_models(&self) -> Result<(), SessionError> {
        self.live.store(true, Ordering::SeqCst);
        self.selection.init().await?;
        self.registry.init().await?;
        Ok(())
    }

    /// The combined readiness of config, history and supervisor, once
    /// [`init`](Self::init) has run.
    pub fn ready_gate(&self) -> Option<Readiness> {
        self.gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|gate| gate.readiness().clone())
    }

    /// Whether user actions should wait.
    pub fn busy(&self) -> bool {
        self.ready_gate().map_or(true, |gate| !gate.get())
    }

    /// Wait until the session is no longer busy.
    pub async fn wait_ready(&self) -> Result<(), SessionError> {
        let gate = self.ready_gate().ok_or(SessionError::NotReady("session"))?;
        let shutdown = self
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        tokio::select! {
            () = gate.wait_ready() => Ok(()),
            _ = shutdown.cancelled() => Err(SessionError::Disposed),
        }
    }

    /// Tear the session down: supervisor (which disposes history and
    /// config), then registry and selection.
    pub async fn dispose(&self) {
        self.shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
        self.gate.lock().unwrap_or_else(PoisonError::into_inner).take();

        self.supervisor.dispose().await;
        self.registry.dispose().await;
        self.selection.dispose().await;

        if self.live.swap(false, Ordering::SeqCst) {
            info!("Session disposed");
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn chat_config(&self) -> &ChatConfigStore {
        &self.chat_config
    }

    pub fn history(&self) -> &ChatHistoryStore {
        &self.history
    }

    pub fn selection(&self) -> &ModelSelectionStore {
        &self.selection
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }
}
