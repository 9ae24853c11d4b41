//! The currently selected model.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use hearth_store::{load_json, save_json, KeyValueStore, Readiness, Resource, ResourceStore};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::download::{CancelSignal, DownloadPipeline, DownloadProgress};
use crate::error::LocalAIError;
use crate::model::ModelDescriptor;
use crate::paths::model_dir;

/// Key the selected descriptor is persisted under.
pub const SELECTED_MODEL_KEY: &str = "llm-model";

/// Holds the selected model and drives its download.
///
/// `ready` is `false` while a download started by
/// [`use_model`](Self::use_model) is in flight. Starting another download
/// cancels the previous one.
#[derive(Clone)]
pub struct ModelSelectionStore {
    shared: Arc<Shared>,
}

struct Shared {
    store: ResourceStore<Option<ModelDescriptor>>,
    storage: Arc<dyn KeyValueStore>,
    pipeline: DownloadPipeline,
    models_root: PathBuf,
    cancel: Mutex<CancelSignal>,
    /// The task finishing the latest download. A new download waits for it
    /// so the two never share a partial file.
    transfer: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    /// Bumped by every `use_model` and by `dispose`; only the latest
    /// download may publish its outcome.
    generation: AtomicU64,
}

/// A download started by [`ModelSelectionStore::use_model`].
pub struct ModelDownload {
    progress: mpsc::UnboundedReceiver<DownloadProgress>,
    outcome: oneshot::Receiver<Result<ModelDescriptor, LocalAIError>>,
}

impl ModelDownload {
    /// Next progress event, or `None` once the transfer has ended.
    pub async fn progress(&mut self) -> Option<DownloadProgress> {
        self.progress.recv().await
    }

    /// Wait for the outcome. A superseded download reports `Cancelled`.
    pub async fn finish(self) -> Result<ModelDescriptor, LocalAIError> {
        self.outcome.await.unwrap_or(Err(LocalAIError::Cancelled))
    }
}

impl ModelSelectionStore {
    pub fn new(
        storage: Arc<dyn KeyValueStore>,
        pipeline: DownloadPipeline,
        models_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store: ResourceStore::new("model", None),
                storage,
                pipeline,
                models_root: models_root.into(),
                cancel: Mutex::new(CancelSignal::new()),
                transfer: tokio::sync::Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Root directory holding one sub-directory per model.
    pub fn models_root(&self) -> &Path {
        &self.shared.models_root
    }

    /// The selected model, if any.
    pub fn selected(&self) -> Option<ModelDescriptor> {
        self.shared.store.get()
    }

    pub fn selected_id(&self) -> Option<String> {
        self.shared.store.borrow().as_ref().map(|m| m.id.clone())
    }

    /// Observe the selection.
    pub fn subscribe(&self) -> watch::Receiver<Option<ModelDescriptor>> {
        self.shared.store.subscribe()
    }

    /// Download `model` (unless already on disk) and select it.
    ///
    /// Any download this store has in flight is cancelled first, and its
    /// cleanup finishes before the new transfer starts. On failure the
    /// selection is left unchanged.
    pub async fn use_model(&self, model: ModelDescriptor) -> Result<ModelDownload, LocalAIError> {
        let shared = &self.shared;
        let source = model.primary_source().cloned();
        let dest = model.artifact_path(&shared.models_root);
        let (Some(source), Some(dest)) = (source, dest) else {
            return Err(LocalAIError::InvalidDescriptor {
                path: PathBuf::from(&model.id),
                message: "no download source".to_string(),
            });
        };

        let mut transfer = shared.transfer.lock().await;
        let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = shared.rearm();
        shared.store.ready().set(false);
        info!("Using model {} ({})", model.id, source.url);

        if let Some(previous) = transfer.take() {
            debug!("Waiting for the previous download to wind down");
            let _ = previous.await;
        }

        if let Err(e) = tokio::fs::create_dir_all(model_dir(&shared.models_root, &model.id)).await {
            shared.restore_ready(generation);
            return Err(e.into());
        }

        let (progress, task) = shared
            .pipeline
            .start(source.url, dest, source.sha256, cancel)
            .into_parts();

        let (tx, outcome) = oneshot::channel();
        let finisher = Arc::clone(shared);
        *transfer = Some(tokio::spawn(async move {
            let result = match task.await {
                Ok(result) => result,
                Err(e) => Err(e.into()),
            };
            let _ = tx.send(finisher.finish(generation, model, result).await);
        }));

        Ok(ModelDownload { progress, outcome })
    }

    /// Cancel the in-flight download, if any.
    pub fn cancel_download(&self) {
        self.shared
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }

    /// Clear the selection and its persisted copy.
    pub async fn unset(&self) -> Result<(), LocalAIError> {
        if self.shared.store.borrow().is_some() {
            info!("Unsetting selected model");
        }
        self.shared.store.set(None);
        self.shared.storage.remove(SELECTED_MODEL_KEY).await?;
        Ok(())
    }
}

impl Shared {
    /// Cancel the current signal and install a fresh one.
    fn rearm(&self) -> CancelSignal {
        let mut slot = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        slot.cancel();
        *slot = CancelSignal::new();
        slot.clone()
    }

    fn is_latest(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn restore_ready(&self, generation: u64) {
        if self.is_latest(generation) {
            self.store.ready().set(true);
        }
    }

    async fn finish(
        &self,
        generation: u64,
        model: ModelDescriptor,
        result: Result<PathBuf, LocalAIError>,
    ) -> Result<ModelDescriptor, LocalAIError> {
        if let Err(e) = result {
            debug!("Download of {} ended: {}", model.id, e);
            self.restore_ready(generation);
            return Err(e);
        }
        if !self.is_latest(generation) {
            debug!("Download of {} was superseded", model.id);
            return Err(LocalAIError::Cancelled);
        }

        self.store.set(Some(model.clone()));
        let saved = save_json(self.storage.as_ref(), SELECTED_MODEL_KEY, &model).await;
        self.restore_ready(generation);
        saved?;

        info!("Selected model {}", model.id);
        Ok(model)
    }
}

#[async_trait]
impl Resource for ModelSelectionStore {
    type Error = LocalAIError;

    fn name(&self) -> &'static str {
        self.shared.store.name()
    }

    fn readiness(&self) -> Readiness {
        self.shared.store.ready().clone()
    }

    async fn init(&self) -> Result<(), LocalAIError> {
        let shared = &self.shared;
        shared.store.activate();

        let selected = match load_json::<ModelDescriptor>(shared.storage.as_ref(), SELECTED_MODEL_KEY)
            .await
        {
            Ok(selected) => selected,
            Err(hearth_store::StoreError::Json(e)) => {
                warn!("Discarding unreadable selected model: {}", e);
                None
            }
            Err(e) => return Err(e.into()),
        };
        if let Some(model) = &selected {
            debug!("Restored selected model {}", model.id);
        }
        shared.store.set(selected);
        shared.store.ready().set(true);
        Ok(())
    }

    async fn dispose(&self) {
        let shared = &self.shared;
        shared.generation.fetch_add(1, Ordering::SeqCst);
        self.cancel_download();
        shared.store.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::descriptor;
    use hearth_store::MemoryStore;
    use httpmock::prelude::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn selection(storage: Arc<MemoryStore>, root: &Path) -> ModelSelectionStore {
        let pipeline = DownloadPipeline::new()
            .unwrap()
            .with_grace_periods(Duration::from_millis(10), Duration::from_millis(10));
        ModelSelectionStore::new(storage, pipeline, root)
    }

    #[tokio::test]
    async fn test_use_model_downloads_and_selects() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/tiny.gguf");
                then.status(200).body("weights");
            })
            .await;

        let dir = tempdir().unwrap();
        let storage = Arc::new(MemoryStore::new());
        let store = selection(storage.clone(), dir.path());
        store.init().await.unwrap();
        assert_eq!(store.selected(), None);

        let model = descriptor("tiny", &server.url("/tiny.gguf"));
        let mut download = store.use_model(model.clone()).await.unwrap();
        assert!(!store.readiness().get());

        let mut last = None;
        while let Some(event) = download.progress().await {
            last = Some(event);
        }
        assert!(last.unwrap().is_complete());
        assert_eq!(download.finish().await.unwrap(), model);

        assert!(store.readiness().get());
        assert_eq!(store.selected_id().as_deref(), Some("tiny"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("tiny/tiny.gguf")).unwrap(),
            "weights"
        );
        assert!(storage.peek(SELECTED_MODEL_KEY).unwrap().contains("\"tiny\""));
    }

    #[tokio::test]
    async fn test_second_use_cancels_first() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/slow.gguf");
                then.status(200)
                    .body("slow")
                    .delay(Duration::from_secs(10));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/fast.gguf");
                then.status(200).body("fast");
            })
            .await;

        let dir = tempdir().unwrap();
        let store = selection(Arc::new(MemoryStore::new()), dir.path());
        store.init().await.unwrap();

        let first = store
            .use_model(descriptor("slow", &server.url("/slow.gguf")))
            .await
            .unwrap();
        let second = store
            .use_model(descriptor("fast", &server.url("/fast.gguf")))
            .await
            .unwrap();

        assert!(matches!(first.finish().await, Err(LocalAIError::Cancelled)));
        assert_eq!(second.finish().await.unwrap().id, "fast");
        assert_eq!(store.selected_id().as_deref(), Some("fast"));
        assert!(store.readiness().get());
        assert!(!dir.path().join("slow/slow.gguf").exists());
        assert!(!dir.path().join("slow/slow.gguf.partial").exists());
    }

    #[tokio::test]
    async fn test_reusing_a_model_mid_download() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/big.gguf");
                then.status(200)
                    .body("big weights")
                    .delay(Duration::from_millis(300));
            })
            .await;

        let dir = tempdir().unwrap();
        let pipeline = DownloadPipeline::new().unwrap();
        let store = ModelSelectionStore::new(Arc::new(MemoryStore::new()), pipeline, dir.path());
        store.init().await.unwrap();

        let model = descriptor("big", &server.url("/big.gguf"));
        let first = store.use_model(model.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = store.use_model(model).await.unwrap();

        assert!(matches!(first.finish().await, Err(LocalAIError::Cancelled)));
        assert_eq!(second.finish().await.unwrap().id, "big");
        assert_eq!(store.selected_id().as_deref(), Some("big"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("big/big.gguf")).unwrap(),
            "big weights"
        );
        assert!(!dir.path().join("big/big.gguf.partial").exists());
        assert!(store.readiness().get());
    }

    #[tokio::test]
    async fn test_failed_download_keeps_selection() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/good.gguf");
                then.status(200).body("good");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/missing.gguf");
                then.status(404);
            })
            .await;

        let dir = tempdir().unwrap();
        let store = selection(Arc::new(MemoryStore::new()), dir.path());
        store.init().await.unwrap();
        store
            .use_model(descriptor("good", &server.url("/good.gguf")))
            .await
            .unwrap()
            .finish()
            .await
            .unwrap();

        let err = store
            .use_model(descriptor("missing", &server.url("/missing.gguf")))
            .await
            .unwrap()
            .finish()
            .await
            .unwrap_err();

        assert!(matches!(err, LocalAIError::DownloadFailed { status: 404, .. }));
        assert!(store.readiness().get());
        assert_eq!(store.selected_id().as_deref(), Some("good"));
        assert!(!dir.path().join("missing/missing.gguf").exists());
    }

    #[tokio::test]
    async fn test_selection_survives_sessions_and_unset_clears_key() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(MemoryStore::new());
        let model = descriptor("tiny", "http://localhost/tiny.gguf");
        save_json(storage.as_ref(), SELECTED_MODEL_KEY, &model)
            .await
            .unwrap();

        let store = selection(storage.clone(), dir.path());
        store.init().await.unwrap();
        assert_eq!(store.selected(), Some(model));

        store.unset().await.unwrap();
        assert_eq!(store.selected(), None);
        assert_eq!(storage.peek(SELECTED_MODEL_KEY), None);
    }

    #[tokio::test]
    async fn test_corrupt_selection_counts_as_first_run() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(MemoryStore::new());
        storage.set(SELECTED_MODEL_KEY, "{oops").await.unwrap();

        let store = selection(storage, dir.path());
        store.init().await.unwrap();
        assert_eq!(store.selected(), None);
        assert!(store.readiness().get());
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = selection(Arc::new(MemoryStore::new()), dir.path());
        store.dispose().await;
        store.init().await.unwrap();
        store.dispose().await;
        store.dispose().await;
        assert!(!store.readiness().get());
    }
}
