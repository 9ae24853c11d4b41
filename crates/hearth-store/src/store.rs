//! The generic resource store and its lifecycle contract.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use indexmap::IndexMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::readiness::Readiness;
use crate::READY;

/// Lifecycle implemented by every store.
///
/// `init` is called once per session; `dispose` releases everything the
/// store owns and may be called any number of times, including on a store
/// that was never initialized. A disposed store may be initialized again.
#[async_trait]
pub trait Resource: Send + Sync {
    /// Error returned by `init`.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// The store's `ready` flag.
    fn readiness(&self) -> Readiness;

    /// Load whatever the store needs, then publish `ready = true`.
    async fn init(&self) -> Result<(), Self::Error>;

    /// Release owned subscriptions and timers.
    async fn dispose(&self);
}

/// Background tasks owned by a store, keyed by name.
#[derive(Default)]
pub struct Subscriptions {
    tasks: IndexMap<&'static str, JoinHandle<()>>,
}

impl Subscriptions {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `task`. A previous task with the same name is aborted.
    pub fn insert(&mut self, name: &'static str, task: JoinHandle<()>) {
        if let Some(previous) = self.tasks.insert(name, task) {
            previous.abort();
        }
    }

    /// Abort one task. Returns `false` if nothing was registered under `name`.
    pub fn release(&mut self, name: &'static str) -> bool {
        match self.tasks.shift_remove(name) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    /// Abort every task, in registration order. Returns how many were released.
    pub fn release_all(&mut self) -> usize {
        let count = self.tasks.len();
        for (_, task) in self.tasks.drain(..) {
            task.abort();
        }
        count
    }

    /// Whether a task is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Number of owned tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no task is owned.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl Drop for Subscriptions {
    fn drop(&mut self) {
        self.release_all();
    }
}

/// A single authoritative value plus named readiness flags and owned tasks.
///
/// Readers get snapshots or a [`watch::Receiver`]; only the owning store
/// writes.
pub struct ResourceStore<T> {
    name: &'static str,
    value: watch::Sender<T>,
    ready: Readiness,
    flags: IndexMap<&'static str, Readiness>,
    subscriptions: Mutex<Subscriptions>,
    live: AtomicBool,
}

impl<T> ResourceStore<T> {
    /// Create a store holding `initial`, with a single `ready` flag set to `false`.
    pub fn new(name: &'static str, initial: T) -> Self {
        let (value, _rx) = watch::channel(initial);
        let ready = Readiness::new(READY);
        let mut flags = IndexMap::new();
        flags.insert(READY, ready.clone());
        Self {
            name,
            value,
            ready,
            flags,
            subscriptions: Mutex::new(Subscriptions::new()),
            live: AtomicBool::new(false),
        }
    }

    /// Add another named flag, initially `false`.
    pub fn with_flag(mut self, flag: &'static str) -> Self {
        self.flags
            .entry(flag)
            .or_insert_with(|| Readiness::new(flag));
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Borrow the current value. Do not hold across an await point.
    pub fn borrow(&self) -> watch::Ref<'_, T> {
        self.value.borrow()
    }

    /// Replace the current value and notify observers.
    pub fn set(&self, value: T) {
        self.value.send_replace(value);
    }

    /// Mutate the current value in place and notify observers.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        self.value.send_modify(f);
    }

    /// Observe the value. The receiver sees the current value immediately.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.value.subscribe()
    }

    /// The `ready` flag.
    pub fn ready(&self) -> &Readiness {
        &self.ready
    }

    /// Look up a flag by name.
    pub fn flag(&self, name: &str) -> Option<&Readiness> {
        self.flags.get(name)
    }

    /// All flags, `ready` first.
    pub fn flags(&self) -> impl Iterator<Item = &Readiness> {
        self.flags.values()
    }

    /// Take ownership of a background task until the store is released.
    pub fn own(&self, name: &'static str, task: JoinHandle<()>) {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, task);
    }

    /// Abort a single owned task.
    pub fn disown(&self, name: &'static str) -> bool {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .release(name)
    }

    /// Whether a task is currently owned under `name`.
    pub fn owns(&self, name: &str) -> bool {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name)
    }

    /// Mark the store as initialized so the next [`release`](Self::release) does work.
    pub fn activate(&self) {
        self.live.store(true, Ordering::SeqCst);
    }

    /// Whether the store has been initialized and not yet released.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Abort every owned task and revoke every flag, so guards still held
    /// by in-flight work do not raise them again.
    ///
    /// Only the first call after [`activate`](Self::activate) does anything;
    /// returns whether this call performed the release.
    pub fn release(&self) -> bool {
        if !self.live.swap(false, Ordering::SeqCst) {
            return false;
        }
        let released = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .release_all();
        for flag in self.flags.values() {
            flag.revoke();
        }
        debug!(store = self.name, released, "store released");
        true
    }
}

impl<T: Clone> ResourceStore<T> {
    /// Snapshot of the current value.
    pub fn get(&self) -> T {
        self.value.borrow().clone()
    }
}
