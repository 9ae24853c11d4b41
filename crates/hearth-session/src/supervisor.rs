//! Keeps the inference server running.
//!
//! ```text
//!            start condition holds
//!   Stopped ───────────────────────► Starting
//!      ▲                                │ spawned + settle delay
//!      │  exit / close / disconnect     ▼
//!      └──────────────────────────── Ready
//! ```
//!
//! The start condition is "a model is selected and its file is on disk".
//! The supervisor restarts the server whenever it stops while the
//! condition holds, and replays an unanswered chat turn each time the
//! server becomes ready.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use hearth_local_ai::{
    CompletionClient, EngineEvent, EngineLauncher, EngineProcess, KillHandle, LocalAIError,
    ModelDescriptor, ModelRegistry, ModelSelectionStore,
};
use hearth_store::{Readiness, Resource, ResourceStore};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ChatConfigStore;
use crate::error::SessionError;
use crate::history::ChatHistoryStore;
use crate::settings::SupervisorConfig;

/// How long a killed server gets to report that it is gone.
const KILL_WAIT: Duration = Duration::from_secs(5);

const ERROR_CAPACITY: usize = 16;

/// Lifecycle state of the inference server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProcessState {
    #[default]
    Stopped,
    Starting,
    Ready,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessStatus {
    pub state: ProcessState,
    /// Number of transitions into `Ready` so far.
    pub epoch: u64,
}

/// Owns the inference server process.
///
/// `ready` is `true` exactly while the state is [`ProcessState::Ready`].
#[derive(Clone)]
pub struct ProcessSupervisor {
    shared: Arc<Shared>,
}

struct Shared {
    store: ResourceStore<ProcessStatus>,
    config: SupervisorConfig,
    launcher: Arc<dyn EngineLauncher>,
    client: CompletionClient,
    selection: ModelSelectionStore,
    registry: ModelRegistry,
    history: Arc<ChatHistoryStore>,
    chat_config: Arc<ChatConfigStore>,
    kill: Mutex<Option<KillHandle>>,
    /// Set by [`ProcessSupervisor::restart`]; the stop it causes is not a
    /// failure.
    restart_requested: AtomicBool,
    shutdown: Mutex<CancellationToken>,
    errors: broadcast::Sender<Arc<SessionError>>,
}

/// The model a server is (to be) started with.
#[derive(Debug, Clone, PartialEq)]
struct Target {
    model: ModelDescriptor,
    path: PathBuf,
}

impl ProcessSupervisor {
    pub fn new(
        config: SupervisorConfig,
        launcher: Arc<dyn EngineLauncher>,
        selection: ModelSelectionStore,
        registry: ModelRegistry,
        history: Arc<ChatHistoryStore>,
        chat_config: Arc<ChatConfigStore>,
    ) -> Self {
        let client = CompletionClient::with_url(config.engine.base_url());
        let (errors, _) = broadcast::channel(ERROR_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                store: ResourceStore::new("process", ProcessStatus::default()),
                config,
                launcher,
                client,
                selection,
                registry,
                history,
                chat_config,
                kill: Mutex::new(None),
                restart_requested: AtomicBool::new(false),
                shutdown: Mutex::new(CancellationToken::new()),
                errors,
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.shared.config
    }

    pub fn status(&self) -> ProcessStatus {
        self.shared.store.get()
    }

    pub fn state(&self) -> ProcessState {
        self.shared.store.borrow().state
    }

    pub fn subscribe(&self) -> watch::Receiver<ProcessStatus> {
        self.shared.store.subscribe()
    }

    /// Failures the supervisor cannot hand to a caller: giving up on a
    /// crash loop, failed replays.
    pub fn errors(&self) -> broadcast::Receiver<Arc<SessionError>> {
        self.shared.errors.subscribe()
    }

    /// Kill the server and wait until a new one is ready.
    ///
    /// The regular restart logic brings the server back; if the start
    /// condition does not hold this waits until it does.
    pub async fn restart(&self) -> Result<(), SessionError> {
        let shared = &self.shared;
        if !shared.store.is_live() {
            return Err(SessionError::NotReady("process"));
        }

        let shutdown = shared.shutdown_token();
        let mut status = shared.store.subscribe();
        let epoch = status.borrow_and_update().epoch;

        info!("Restarting inference server");
        shared.restart_requested.store(true, Ordering::SeqCst);
        shared.kill_process();

        tokio::select! {
            result = status.wait_for(|s| s.epoch > epoch) => {
                result.map_err(|_| SessionError::Disposed)?;
                Ok(())
            }
            _ = shutdown.cancelled() => Err(SessionError::Disposed),
        }
    }
}

impl Shared {
    fn shutdown_token(&self) -> CancellationToken {
        self.shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_kill(&self, kill: Option<KillHandle>) {
        *self.kill.lock().unwrap_or_else(PoisonError::into_inner) = kill;
    }

    fn kill_process(&self) {
        if let Some(kill) = self.kill.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            kill.kill();
        }
    }

    /// Publish a new state. The flag moves before the value so that anyone
    /// woken by the value already sees the matching flag.
    fn set_state(&self, state: ProcessState) {
        self.store.ready().set(state == ProcessState::Ready);
        self.store.update(|status| {
            status.state = state;
            if state == ProcessState::Ready {
                status.epoch += 1;
            }
        });
    }

    /// The model to run, if the start condition holds.
    fn target(&self) -> Option<Target> {
        let model = self.selection.selected()?;
        if !self.registry.is_downloaded(&model.id) {
            return None;
        }
        let path = model.artifact_path(self.registry.models_root())?;
        Some(Target { model, path })
    }

    fn report(&self, e: SessionError) {
        let _ = self.errors.send(Arc::new(e));
    }

    /// The restart watch: runs until the supervisor is disposed.
    async fn watch(self: Arc<Self>) {
        let mut selected = self.selection.subscribe();
        let mut downloads = self.registry.subscribe_status();
        let mut failures: u32 = 0;
        let mut last_error: Option<SessionError> = None;

        loop {
            let Some(target) = self.target() else {
                debug!("Waiting for a downloaded model to be selected");
                if !changed(&mut selected, &mut downloads).await {
                    return;
                }
                continue;
            };

            let max = self.config.max_restarts;
            if max > 0 && failures >= max {
                let report = SessionError::CrashLoop {
                    model: target.model.id.clone(),
                    attempts: failures,
                    last: last_error
                        .take()
                        .map(|e| e.to_string())
                        .unwrap_or_default(),
                };
                error!("{}", report);
                self.report(report);

                selected.borrow_and_update();
                downloads.borrow_and_update();
                if !changed(&mut selected, &mut downloads).await {
                    return;
                }
                failures = 0;
                continue;
            }

            let delay = self.config.backoff(failures);
            if !delay.is_zero() {
                debug!("Next start attempt in {:?}", delay);
                tokio::time::sleep(delay).await;
            }

            match self.serve(&target, &mut selected, &mut downloads).await {
                Ok(()) => failures = 0,
                Err(e) => {
                    failures += 1;
                    warn!("Inference server failed (attempt {}): {}", failures, e);
                    last_error = Some(e);
                }
            }
        }
    }

    /// Run one server for `target` until it stops.
    ///
    /// Succeeds if the server stayed ready for `stable_after`, or was
    /// stopped on purpose (target changed, explicit restart). Fails if it
    /// never got to ready or went down soon after.
    async fn serve(
        &self,
        target: &Target,
        selected: &mut watch::Receiver<Option<ModelDescriptor>>,
        downloads: &mut watch::Receiver<BTreeMap<String, bool>>,
    ) -> Result<(), SessionError> {
        self.set_state(ProcessState::Starting);
        self.restart_requested.store(false, Ordering::SeqCst);

        let options = self
            .config
            .engine
            .merged(&target.path, &target.model.settings);
        info!("Launching inference server for model {}", target.model.id);

        let mut process = match self.launcher.launch(&options).await {
            Ok(process) => process,
            Err(e) => {
                self.set_state(ProcessState::Stopped);
                return Err(e.into());
            }
        };
        self.set_kill(Some(process.kill_handle()));

        let settle = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(settle);
        let mut settling = false;
        let mut ready_at: Option<Instant> = None;
        let mut superseded = false;
        let mut ended = false;
        let mut exit_code = None;

        let probe_every = self.config.health_interval.filter(|d| !d.is_zero());
        let mut probe = tokio::time::interval(probe_every.unwrap_or(Duration::from_secs(3600)));
        probe.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // At most one check in flight; dropping the set aborts it.
        let mut checks: JoinSet<Result<(), LocalAIError>> = JoinSet::new();

        loop {
            tokio::select! {
                event = process.next_event() => match event {
                    Some(EngineEvent::Spawned) => {
                        debug!("Inference server spawned, settling for {:?}", self.config.settle_delay);
                        settle.as_mut().reset(Instant::now() + self.config.settle_delay);
                        settling = true;
                    }
                    Some(EngineEvent::Exited(code)) => {
                        info!("Inference server exited (code: {:?})", code);
                        exit_code = code;
                        ended = true;
                        break;
                    }
                    Some(EngineEvent::Closed) | None => {
                        info!("Inference server closed");
                        ended = true;
                        break;
                    }
                    Some(EngineEvent::Disconnected) => {
                        warn!("Inference server disconnected");
                        break;
                    }
                },
                () = &mut settle, if settling => {
                    settling = false;
                    ready_at = Some(Instant::now());
                    self.set_state(ProcessState::Ready);
                    info!("Inference server ready");
                    probe.reset();
                    self.replay();
                }
                _ = probe.tick(), if ready_at.is_some() && probe_every.is_some() => {
                    if checks.is_empty() {
                        let client = self.client.clone();
                        checks.spawn(async move { client.check_health().await });
                    }
                }
                Some(result) = checks.join_next(), if !checks.is_empty() => {
                    if let Ok(Err(e)) = result {
                        warn!("Health check failed, treating server as disconnected: {}", e);
                        break;
                    }
                }
                result = selected.changed() => {
                    if result.is_err() || self.target().as_ref() != Some(target) {
                        info!("Selected model changed, stopping inference server");
                        superseded = true;
                        break;
                    }
                }
                result = downloads.changed() => {
                    if result.is_err() || self.target().as_ref() != Some(target) {
                        info!("Model files changed, stopping inference server");
                        superseded = true;
                        break;
                    }
                }
            }
        }

        self.set_state(ProcessState::Stopped);
        self.set_kill(None);
        if !ended {
            process.kill();
            wait_closed(&mut process).await;
        }

        if superseded || self.restart_requested.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        match ready_at.map(|at| at.elapsed()) {
            None => Err(SessionError::ExitedEarly(exit_code)),
            Some(uptime) if uptime < self.config.stable_after => Err(SessionError::Unstable {
                uptime,
                code: exit_code,
            }),
            Some(_) => Ok(()),
        }
    }

    /// Answer a chat turn the previous server never got to.
    fn replay(&self) {
        if !self.history.awaiting_reply() {
            return;
        }
        let history = Arc::clone(&self.history);
        let errors = self.errors.clone();
        self.store.own(
            "replay",
            tokio::spawn(async move {
                if let Err(e) = history.request_completion(None).await {
                    warn!("Replay failed: {}", e);
                    let _ = errors.send(Arc::new(e));
                }
            }),
        );
    }
}

/// Wait for either receiver to see a change. `false` if a sender is gone.
async fn changed<A, B>(a: &mut watch::Receiver<A>, b: &mut watch::Receiver<B>) -> bool {
    tokio::select! {
        result = a.changed() => result.is_ok(),
        result = b.changed() => result.is_ok(),
    }
}

async fn wait_closed(process: &mut EngineProcess) {
    let closed = async {
        while let Some(event) = process.next_event().await {
            if matches!(event, EngineEvent::Exited(_) | EngineEvent::Closed) {
                break;
            }
        }
    };
    if tokio::time::timeout(KILL_WAIT, closed).await.is_err() {
        warn!("Inference server did not confirm shutdown");
    }
}

#[async_trait]
impl Resource for ProcessSupervisor {
    type Error = SessionError;

    fn name(&self) -> &'static str {
        self.shared.store.name()
    }

    fn readiness(&self) -> Readiness {
        self.shared.store.ready().clone()
    }

    /// Start the restart watch. The server itself comes up once the start
    /// condition holds.
    async fn init(&self) -> Result<(), SessionError> {
        let shared = &self.shared;
        shared.store.activate();
        *shared.shutdown.lock().unwrap_or_else(PoisonError::into_inner) = CancellationToken::new();
        shared.set_state(ProcessState::Stopped);
        shared
            .store
            .own("restart-watch", tokio::spawn(Arc::clone(shared).watch()));
        debug!("Process supervisor started");
        Ok(())
    }

    /// Stop restarting, kill the server, then dispose history and config.
    async fn dispose(&self) {
        let shared = &self.shared;
        shared.shutdown_token().cancel();
        if shared.store.release() {
            info!("Process supervisor disposed");
        }
        shared.kill_process();
        shared.set_kill(None);
        shared.set_state(ProcessState::Stopped);

        shared.history.dispose().await;
        shared.chat_config.dispose().await;
    }
}
