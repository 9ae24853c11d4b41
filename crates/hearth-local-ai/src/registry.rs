//! The catalog of known models and which of them are on disk.

use std::collections::{BTreeMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use hearth_store::{Readiness, Resource, ResourceStore};
use tokio::fs;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::error::LocalAIError;
use crate::model::ModelDescriptor;
use crate::paths::model_dir;
use crate::selection::ModelSelectionStore;

const ERROR_CAPACITY: usize = 16;

/// Model descriptors plus their download status.
///
/// A model counts as downloaded when `<models_root>/<id>/<artifact>`
/// exists. `ready` is `false` while a scan or a removal is running; scans
/// and removals are serialized on it. Scan failures are published on
/// [`errors`](Self::errors) and never returned.
#[derive(Clone)]
pub struct ModelRegistry {
    shared: Arc<Shared>,
}

struct Shared {
    store: ResourceStore<Vec<ModelDescriptor>>,
    status: watch::Sender<BTreeMap<String, bool>>,
    errors: broadcast::Sender<Arc<LocalAIError>>,
    catalog_dir: PathBuf,
    models_root: PathBuf,
    selection: ModelSelectionStore,
}

impl ModelRegistry {
    /// `catalog_dir` holds descriptor `*.json` files; model files live
    /// under `selection`'s model root.
    pub fn new(catalog_dir: impl Into<PathBuf>, selection: ModelSelectionStore) -> Self {
        let (status, _) = watch::channel(BTreeMap::new());
        let (errors, _) = broadcast::channel(ERROR_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                store: ResourceStore::new("registry", Vec::new()),
                status,
                errors,
                catalog_dir: catalog_dir.into(),
                models_root: selection.models_root().to_path_buf(),
                selection,
            }),
        }
    }

    pub fn catalog_dir(&self) -> &Path {
        &self.shared.catalog_dir
    }

    pub fn models_root(&self) -> &Path {
        &self.shared.models_root
    }

    /// Known descriptors, in catalog file order.
    pub fn models(&self) -> Vec<ModelDescriptor> {
        self.shared.store.get()
    }

    pub fn find(&self, id: &str) -> Option<ModelDescriptor> {
        self.shared.store.borrow().iter().find(|m| m.id == id).cloned()
    }

    /// Download status by model id.
    pub fn status(&self) -> BTreeMap<String, bool> {
        self.shared.status.borrow().clone()
    }

    pub fn is_downloaded(&self, id: &str) -> bool {
        self.shared.status.borrow().get(id).copied().unwrap_or(false)
    }

    /// Observe the download status.
    pub fn subscribe_status(&self) -> watch::Receiver<BTreeMap<String, bool>> {
        self.shared.status.subscribe()
    }

    /// Observe the descriptor list.
    pub fn subscribe(&self) -> watch::Receiver<Vec<ModelDescriptor>> {
        self.shared.store.subscribe()
    }

    /// Scan failures: malformed descriptors, unreadable directories.
    pub fn errors(&self) -> broadcast::Receiver<Arc<LocalAIError>> {
        self.shared.errors.subscribe()
    }

    /// Rescan descriptors and model files. Waits for any running scan or
    /// removal, so it must not be awaited before `init`.
    pub async fn refresh(&self) {
        let _guard = self.shared.store.ready().acquire().await;
        self.shared.scan().await;
    }

    /// Delete a downloaded model's directory.
    ///
    /// Unsets the selection if it points at the model. The registry is
    /// rescanned afterwards whether or not the removal succeeded.
    pub async fn remove(&self, id: &str) -> Result<(), LocalAIError> {
        let shared = &self.shared;
        let _guard = shared.store.ready().acquire().await;

        if !self.is_downloaded(id) {
            return Err(LocalAIError::NotDownloaded(id.to_string()));
        }

        let result = shared.remove_model(id).await;
        shared.scan().await;
        result
    }
}

impl Shared {
    async fn remove_model(&self, id: &str) -> Result<(), LocalAIError> {
        if self.selection.selected_id().as_deref() == Some(id) {
            self.selection.unset().await?;
        }

        let dir = model_dir(&self.models_root, id);
        match fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => {}
            _ => {
                error!("Model {} is marked downloaded but {:?} is missing", id, dir);
                return Err(LocalAIError::RegistryDesync(id.to_string()));
            }
        }

        fs::remove_dir_all(&dir).await?;
        info!("Removed model {} ({:?})", id, dir);
        Ok(())
    }

    async fn scan(&self) {
        match read_catalog(&self.catalog_dir).await {
            Ok((models, failures)) => {
                for failure in failures {
                    self.report(failure);
                }
                self.store.set(models);
            }
            Err(e) => self.report(e),
        }

        let mut status = BTreeMap::new();
        let models = self.store.get();
        for model in &models {
            let present = match model.artifact_path(&self.models_root) {
                Some(path) => is_file(&path).await,
                None => false,
            };
            status.insert(model.id.clone(), present);
        }
        debug!(
            "Scanned {} models, {} downloaded",
            status.len(),
            status.values().filter(|d| **d).count()
        );
        self.status.send_replace(status);
    }

    fn report(&self, e: LocalAIError) {
        warn!("Model scan: {}", e);
        let _ = self.errors.send(Arc::new(e));
    }
}

/// Load every `*.json` descriptor in `dir`, sorted by file name.
///
/// Descriptors that fail to parse (or repeat an id) are returned
/// separately. A missing directory is an empty catalog.
async fn read_catalog(
    dir: &Path,
) -> Result<(Vec<ModelDescriptor>, Vec<LocalAIError>), LocalAIError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("Catalog {:?} does not exist", dir);
            return Ok((Vec::new(), Vec::new()));
        }
        Err(e) => return Err(e.into()),
    };

    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut models = Vec::new();
    let mut failures = Vec::new();
    let mut seen = HashSet::new();
    for path in paths {
        match ModelDescriptor::load(&path).await {
            Ok(model) if !seen.insert(model.id.clone()) => {
                failures.push(LocalAIError::InvalidDescriptor {
                    path,
                    message: format!("duplicate model id '{}'", model.id),
                });
            }
            Ok(model) => models.push(model),
            Err(e) => failures.push(e),
        }
    }
    Ok((models, failures))
}

async fn is_file(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

#[async_trait]
impl Resource for ModelRegistry {
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
        shared.scan().await;
        shared.store.ready().set(true);

        // A new selection usually means a file just finished downloading.
        let mut selected = shared.selection.subscribe();
        selected.borrow_and_update();
        let watcher = Arc::clone(shared);
        shared.store.own(
            "selection-watch",
            tokio::spawn(async move {
                while selected.changed().await.is_ok() {
                    let _guard = watcher.store.ready().acquire().await;
                    watcher.scan().await;
                }
            }),
        );

        info!("Model registry ready ({} models)", shared.store.borrow().len());
        Ok(())
    }

    async fn dispose(&self) {
        self.shared.store.release();
    }
}
