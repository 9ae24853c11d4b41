//! Observable readiness flags and the AND-gate that combines them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::select_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// A named boolean flag that replays its current value to new observers.
///
/// Cloning yields another handle to the same flag.
#[derive(Clone)]
pub struct Readiness {
    name: &'static str,
    tx: Arc<watch::Sender<bool>>,
    /// Bumped by `revoke`; guards taken under an older epoch do not restore.
    epoch: Arc<AtomicU64>,
}

impl Readiness {
    /// Create a flag, initially `false`.
    pub fn new(name: &'static str) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            name,
            tx: Arc::new(tx),
            epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Name used in logs and errors.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current value.
    pub fn get(&self) -> bool {
        *self.tx.borrow()
    }

    /// Publish a new value. Observers are only woken when the value changes.
    ///
    /// Returns `true` if the value changed.
    pub fn set(&self, ready: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == ready {
                false
            } else {
                *current = ready;
                true
            }
        });
        if changed {
            trace!(flag = self.name, ready, "readiness changed");
        }
        changed
    }

    /// Observe the flag. The receiver sees the current value immediately.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Wait until the flag reads `value`.
    pub async fn wait_for(&self, value: bool) {
        let mut rx = self.subscribe();
        // The sender lives as long as `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|current| *current == value).await;
    }

    /// Wait until the flag reads `true`.
    pub async fn wait_ready(&self) {
        self.wait_for(true).await;
    }

    /// Lower the flag and void every outstanding [`ReadyGuard`].
    ///
    /// Used when the owner is torn down: work still in flight must not
    /// raise the flag again when it finishes.
    pub fn revoke(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.set(false);
    }

    /// Flip the flag from `true` to `false` atomically.
    ///
    /// Returns `None` if the flag was already `false`. The returned guard
    /// flips the flag back to `true` when dropped, unless the flag was
    /// revoked in the meantime.
    pub fn try_acquire(&self) -> Option<ReadyGuard> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let acquired = self.tx.send_if_modified(|current| {
            if *current {
                *current = false;
                true
            } else {
                false
            }
        });
        acquired.then(|| ReadyGuard {
            flag: self.clone(),
            epoch,
        })
    }

    /// Wait for the flag to become `true`, then take it.
    ///
    /// Concurrent callers are admitted one at a time.
    pub async fn acquire(&self) -> ReadyGuard {
        let mut rx = self.subscribe();
        loop {
            if let Some(guard) = self.try_acquire() {
                return guard;
            }
            let _ = rx.wait_for(|current| *current).await;
        }
    }
}

impl std::fmt::Debug for Readiness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Readiness")
            .field("name", &self.name)
            .field("ready", &self.get())
            .finish()
    }
}

/// Holds a [`Readiness`] flag at `false`; restores `true` on drop unless
/// the flag was revoked while held.
#[must_use = "the flag is restored as soon as the guard is dropped"]
pub struct ReadyGuard {
    flag: Readiness,
    epoch: u64,
}

impl ReadyGuard {
    /// The flag being held.
    pub fn flag(&self) -> &Readiness {
        &self.flag
    }
}

impl Drop for ReadyGuard {
    fn drop(&mut self) {
        // Checked under the channel lock so a concurrent revoke wins.
        let mut revoked = false;
        self.flag.tx.send_if_modified(|current| {
            revoked = self.flag.epoch.load(Ordering::SeqCst) != self.epoch;
            if revoked || *current {
                return false;
            }
            *current = true;
            true
        });
        if revoked {
            trace!(flag = self.flag.name, "flag revoked while held, not restoring");
        }
    }
}

/// Logical AND over several readiness flags, recomputed on every change.
///
/// The combined value is published on its own [`Readiness`] flag, so new
/// observers see the current combination without waiting for a change.
pub struct ReadinessGate {
    output: Readiness,
    task: Option<JoinHandle<()>>,
}

impl ReadinessGate {
    /// Combine `inputs`. Must be called from within a tokio runtime.
    ///
    /// An empty set of inputs is always ready.
    pub fn all(name: &'static str, inputs: impl IntoIterator<Item = Readiness>) -> Self {
        let output = Readiness::new(name);
        let mut receivers: Vec<watch::Receiver<bool>> =
            inputs.into_iter().map(|flag| flag.subscribe()).collect();

        if receivers.is_empty() {
            output.set(true);
            return Self { output, task: None };
        }

        // Publish the initial combination before returning.
        output.set(combine(&mut receivers));

        let task = tokio::spawn(run_gate(output.clone(), receivers));
        Self {
            output,
            task: Some(task),
        }
    }

    /// The combined flag.
    pub fn readiness(&self) -> &Readiness {
        &self.output
    }

    /// Current combined value.
    pub fn get(&self) -> bool {
        self.output.get()
    }

    /// Observe the combined value.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.output.subscribe()
    }

    /// Wait until every input is ready.
    pub async fn wait_ready(&self) {
        self.output.wait_ready().await;
    }
}

impl Drop for ReadinessGate {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn combine(receivers: &mut [watch::Receiver<bool>]) -> bool {
    // Mark every input as seen, no short-circuit.
    receivers
        .iter_mut()
        .fold(true, |all, rx| *rx.borrow_and_update() && all)
}

async fn run_gate(output: Readiness, mut receivers: Vec<watch::Receiver<bool>>) {
    loop {
        let changed = select_all(receivers.iter_mut().map(|rx| Box::pin(rx.changed())))
            .await
            .0;
        if changed.is_err() {
            debug!(gate = output.name(), "input flag dropped, closing gate");
            output.set(false);
            return;
        }
        output.set(combine(&mut receivers));
    }
}
