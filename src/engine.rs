//! Snapshot engine
//!
//! This module provides [`SnapshotEngine`], the entry point for creating,
//! restoring, deleting and listing snapshots, and for recovering state left
//! behind by a previous process.
//!
//! ## Overview
//!
//! The engine coordinates several subsystems:
//!
//! - **Catalog**: what snapshots exist on disk
//! - **Lock**: at most one creation or restoration at a time, across processes
//! - **Progress**: size sampling and heartbeats for long-running pipelines
//! - **Runtime**: helper containers for volume-backed storage
//! - **Pipelines**: local `tar` pipelines for bind-mounted storage
//! - **Retention**: keeps the number of completed snapshots bounded
//!
//! ## Cancellation
//!
//! Creation takes a [`CancellationToken`]. Every running operation is also
//! registered in a single "current operation" slot, so
//! [`SnapshotEngine::cancel_current`] can reach it from another thread.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use coldsnap::{EngineBuilder, JsonConfigStore, StorageDescriptor};
//! use tokio_util::sync::CancellationToken;
//! use std::sync::Arc;
//!
//! # fn main() -> coldsnap::Result<()> {
//! let engine = EngineBuilder::new(Arc::new(JsonConfigStore::new("settings.json"))).build()?;
//! engine.recover()?;
//!
//! let storage = StorageDescriptor::volume("vm-data");
//! let snapshot = engine.create_snapshot("before update", &storage, None, &CancellationToken::new(), None)?;
//! engine.restore_snapshot(&snapshot.id, &storage)?;
//! # Ok(())
//! # }
//! ```

use crate::catalog::Catalog;
use crate::config::{ConfigHandle, ConfigStore, EngineOptions, SnapshotSettings};
use crate::error::{Result, SnapshotError};
use crate::lock::LockCoordinator;
use crate::markers;
use crate::pipeline::{self, DiagnosticTail};
use crate::progress::Ticker;
use crate::retention;
use crate::runtime::{CliRuntime, ContainerRuntime, HelperTask};
use crate::types::{LockReason, ProgressCallback, Snapshot, SnapshotInProgress, StorageDescriptor};
use crate::utils;
use parking_lot::Mutex;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const HELPER_POLL: Duration = Duration::from_millis(100);

/// The operation currently running in this engine
#[derive(Debug, Clone)]
pub(crate) struct CurrentOperation {
    pub(crate) id: String,
    pub(crate) kind: LockReason,
    pub(crate) token: CancellationToken,
}

/// Samplers started for a snapshot found in progress at startup
#[derive(Debug)]
pub(crate) struct Attachment {
    pub(crate) id: String,
    pub(crate) sampler: Ticker,
    pub(crate) reconciler: Ticker,
}

impl Attachment {
    pub(crate) fn stop(&self) {
        self.sampler.stop();
        self.reconciler.stop();
    }
}

/// Clears the current-operation slot when dropped
pub(crate) struct SlotGuard<'a> {
    slot: &'a Mutex<Option<CurrentOperation>>,
    id: String,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        if slot.as_ref().is_some_and(|op| op.id == self.id) {
            *slot = None;
        }
    }
}

/// Main entry point for snapshot operations
///
/// All mutating operations are serialized by the on-disk lock; read-only
/// operations ([`SnapshotEngine::list_snapshots`], [`SnapshotEngine::is_busy`])
/// can run at any time.
pub struct SnapshotEngine {
    pub(crate) config: ConfigHandle,
    pub(crate) runtime: Arc<dyn ContainerRuntime>,
    pub(crate) options: EngineOptions,
    pub(crate) current: Mutex<Option<CurrentOperation>>,
    pub(crate) attached: Mutex<Vec<Attachment>>,
}

impl std::fmt::Debug for SnapshotEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotEngine")
            .field("options", &self.options)
            .field("current", &self.current.lock().as_ref().map(|op| op.id.clone()))
            .finish_non_exhaustive()
    }
}

impl SnapshotEngine {
    /// Configuration handle shared with the engine's timers
    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    /// Engine options
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub(crate) fn settings(&self) -> Result<SnapshotSettings> {
        self.config.read()
    }

    /// Catalog over the configured snapshot root
    pub fn catalog(&self) -> Result<Catalog> {
        Catalog::open(self.settings()?.root()?)
    }

    pub(crate) fn lock_for(&self, catalog: &Catalog) -> LockCoordinator {
        LockCoordinator::new(catalog.root())
    }

    /// List all snapshots, newest first
    pub fn list_snapshots(&self) -> Result<Vec<Snapshot>> {
        self.catalog()?.list()
    }

    /// Delete a snapshot
    ///
    /// # Errors
    ///
    /// - [`SnapshotError::NotFound`] for unknown ids
    /// - [`SnapshotError::Busy`] when the snapshot is being produced or a
    ///   restoration is running
    #[instrument(skip(self))]
    pub fn delete_snapshot(&self, id: &str) -> Result<()> {
        let catalog = self.catalog()?;
        let lock = self.lock_for(&catalog);
        if catalog.is_in_progress(id) {
            return Err(SnapshotError::Busy {
                reason: LockReason::Snapshot,
            });
        }
        if lock.reason() == Some(LockReason::Restore) {
            return Err(SnapshotError::Busy {
                reason: LockReason::Restore,
            });
        }
        catalog.delete(id)
    }

    /// Whether a creation or restoration holds the lock
    ///
    /// An unreadable configuration reads as idle and is logged; operations
    /// then fail with the underlying error.
    pub fn is_busy(&self) -> bool {
        match self.catalog() {
            Ok(catalog) => self.lock_for(&catalog).is_held(),
            Err(e) => {
                warn!("Cannot read lock state: {}", e);
                false
            }
        }
    }

    /// Reason recorded by the current lock holder
    pub fn busy_reason(&self) -> Option<LockReason> {
        self.catalog().ok().and_then(|c| self.lock_for(&c).reason())
    }

    /// Completed snapshots a new creation would delete, oldest first
    pub fn preview_retention(&self) -> Result<Vec<Snapshot>> {
        let settings = self.settings()?;
        retention::preview(&Catalog::new(settings.root()?), settings.snapshot_max_count)
    }

    /// Snapshots currently being produced
    ///
    /// Records whose directory no longer carries `.in-progress` are dropped
    /// from the configuration document.
    pub fn in_progress(&self) -> Result<Vec<(String, SnapshotInProgress)>> {
        let catalog = self.catalog()?;
        self.config.update(|settings| {
            settings
                .snapshots_in_progress
                .retain(|id, _| catalog.is_in_progress(id));
            settings
                .snapshots_in_progress
                .iter()
                .map(|(id, record)| (id.clone(), record.clone()))
                .collect()
        })
    }

    /// Id and kind of the operation running in this engine
    pub fn current_operation(&self) -> Option<(String, LockReason)> {
        self.current.lock().as_ref().map(|op| (op.id.clone(), op.kind))
    }

    pub(crate) fn register(&self, id: &str, kind: LockReason, token: CancellationToken) -> SlotGuard<'_> {
        *self.current.lock() = Some(CurrentOperation {
            id: id.to_string(),
            kind,
            token,
        });
        SlotGuard {
            slot: &self.current,
            id: id.to_string(),
        }
    }

    /// Cancel the running operation
    ///
    /// With `id`, only an operation on that snapshot is cancelled. When this
    /// engine is not running it, a snapshot left in progress by a previous
    /// process is cancelled instead: its helper container or pipeline is
    /// killed and the partial snapshot discarded. Completed snapshots are
    /// never deleted by this call.
    ///
    /// Returns whether anything was cancelled.
    #[instrument(skip(self))]
    pub fn cancel_current(&self, id: Option<&str>) -> Result<bool> {
        {
            let slot = self.current.lock();
            if let Some(op) = slot.as_ref() {
                if id.map_or(true, |id| id == op.id) {
                    info!("Cancelling {} of {}", op.kind, op.id);
                    op.token.cancel();
                    return Ok(true);
                }
            }
        }

        match id {
            Some(id) => self.cancel_orphan(id),
            None => Ok(false),
        }
    }

    fn cancel_orphan(&self, id: &str) -> Result<bool> {
        let catalog = self.catalog()?;
        if !catalog.is_in_progress(id) {
            debug!("{} is not in progress, nothing to cancel", id);
            return Ok(false);
        }

        self.detach(id);
        let dir = catalog.snapshot_dir(id);
        let record = self.settings()?.snapshots_in_progress.get(id).cloned();

        if let Some(container) = record.as_ref().and_then(|r| r.container_id.as_deref()) {
            if self.runtime.is_running(container).unwrap_or(false) {
                if let Err(e) = self.runtime.kill(container) {
                    warn!("Failed to kill helper {}: {}", container, e);
                }
            }
            if let Err(e) = self.runtime.remove(container) {
                debug!("remove {}: {}", container, e);
            }
        }

        let bind_pid = markers::read_bind_active(&dir)
            .filter(|m| !m.is_in_process_copy())
            .map(|m| m.pid)
            .or_else(|| record.as_ref().and_then(|r| r.bind_pid));
        if let Some(pid) = bind_pid.filter(|pid| *pid != std::process::id()) {
            pipeline::terminate_process_group(pid, self.options.kill_grace);
        }

        for marker in markers::ALL {
            markers::clear(&dir, marker)?;
        }
        self.config.remove_record(id)?;
        utils::remove_path(&dir)?;

        let lock = self.lock_for(&catalog);
        if lock.reason() == Some(LockReason::Snapshot) && lock.is_stale() {
            lock.release();
        }
        info!("Discarded orphaned snapshot {}", id);
        Ok(true)
    }

    pub(crate) fn detach(&self, id: &str) {
        let removed: Vec<Attachment> = {
            let mut attached = self.attached.lock();
            let (removed, kept) = attached.drain(..).partition(|a| a.id == id);
            *attached = kept;
            removed
        };
        for attachment in removed {
            attachment.stop();
        }
    }

    /// Stop every sampler started by [`SnapshotEngine::attach_to_in_progress`]
    pub fn detach_all(&self) {
        let attached: Vec<Attachment> = self.attached.lock().drain(..).collect();
        for attachment in &attached {
            attachment.stop();
        }
        if !attached.is_empty() {
            info!("Detached from {} in-progress snapshots", attached.len());
        }
    }

    /// Run a helper container to completion
    ///
    /// `on_started` receives the container id before the engine starts
    /// waiting; an error from it aborts the helper. The container is always
    /// removed once it has exited or been killed.
    pub(crate) fn run_helper(
        &self,
        task: &HelperTask,
        id: &str,
        cancel: &CancellationToken,
        on_started: impl FnOnce(&str) -> Result<()>,
    ) -> Result<()> {
        let stage = task.stage();
        let container = self.runtime.spawn_helper(task)?;

        let discard = |runtime: &dyn ContainerRuntime| {
            if let Err(e) = runtime.kill(&container) {
                debug!("kill {}: {}", container, e);
            }
            if let Err(e) = runtime.remove(&container) {
                debug!("remove {}: {}", container, e);
            }
        };

        if let Err(e) = on_started(&container) {
            discard(self.runtime.as_ref());
            return Err(e);
        }

        let tail = Arc::new(Mutex::new(DiagnosticTail::new(stage)));
        let logs = {
            let runtime = Arc::clone(&self.runtime);
            let container = container.clone();
            let tail = Arc::clone(&tail);
            thread::spawn(move || {
                let on_line = |line: &str| tail.lock().push(line.to_string());
                if let Err(e) = runtime.stream_logs(&container, &on_line) {
                    debug!("Log stream for {} ended: {}", container, e);
                }
            })
        };

        let (tx, rx) = mpsc::channel();
        {
            let runtime = Arc::clone(&self.runtime);
            let container = container.clone();
            thread::spawn(move || {
                let _ = tx.send(runtime.wait(&container));
            });
        }

        let exit = loop {
            if cancel.is_cancelled() {
                warn!(stage, "Cancelling helper {} for {}", container, id);
                discard(self.runtime.as_ref());
                return Err(SnapshotError::Cancelled(id.to_string()));
            }
            match rx.recv_timeout(HELPER_POLL) {
                Ok(exit) => break exit,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    break Err(SnapshotError::runtime(format!("lost track of helper {}", container)))
                }
            }
        };

        let code = match exit {
            Ok(code) => code,
            Err(e) => {
                discard(self.runtime.as_ref());
                return Err(e);
            }
        };
        let _ = logs.join();
        if let Err(e) = self.runtime.remove(&container) {
            debug!("remove {}: {}", container, e);
        }

        if code == 0 {
            info!(stage, "Helper {} for {} finished", container, id);
            return Ok(());
        }

        let err = std::mem::replace(&mut *tail.lock(), DiagnosticTail::new(stage)).into_error(Some(code));
        error!(
            stage,
            "Helper for {} failed: {}\n{}",
            id,
            err,
            err.diagnostic_tail().unwrap_or_default()
        );
        Err(err)
    }

    /// Create a snapshot from a blocking context on a tokio runtime
    ///
    /// Runs [`SnapshotEngine::create_snapshot`] on the blocking thread pool.
    pub async fn create_snapshot_async(
        self: &Arc<Self>,
        name: String,
        storage: StorageDescriptor,
        on_progress: Option<ProgressCallback>,
        cancel: CancellationToken,
        id_hint: Option<String>,
    ) -> Result<Snapshot> {
        let engine = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            engine.create_snapshot(&name, &storage, on_progress, &cancel, id_hint.as_deref())
        })
        .await
        .map_err(|e| SnapshotError::internal(format!("Snapshot task failed: {}", e)))?
    }

    /// Restore a snapshot on the blocking thread pool
    pub async fn restore_snapshot_async(self: &Arc<Self>, id: String, storage: StorageDescriptor) -> Result<()> {
        let engine = Arc::clone(self);
        tokio::task::spawn_blocking(move || engine.restore_snapshot(&id, &storage))
            .await
            .map_err(|e| SnapshotError::internal(format!("Restore task failed: {}", e)))?
    }
}

impl Drop for SnapshotEngine {
    fn drop(&mut self) {
        self.detach_all();
    }
}

/// Builder for configuring a [`SnapshotEngine`]
///
/// # Examples
///
/// ```rust
/// use coldsnap::{EngineBuilder, MemoryConfigStore, SnapshotSettings};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let store = Arc::new(MemoryConfigStore::new(SnapshotSettings::with_root("/tmp/snaps")));
/// let engine = EngineBuilder::new(store)
///     .sample_interval(Duration::from_secs(1))
///     .runtime_exe("podman")
///     .build()
///     .unwrap();
/// assert_eq!(engine.options().runtime_exe, "podman");
/// ```
pub struct EngineBuilder {
    store: Arc<dyn ConfigStore>,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    options: EngineOptions,
}

impl EngineBuilder {
    /// Builder over a configuration store with default options
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self {
            store,
            runtime: None,
            options: EngineOptions::default(),
        }
    }

    /// Use a specific container runtime instead of the CLI one
    pub fn runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Replace all options at once
    pub fn options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Size sampling interval
    pub fn sample_interval(mut self, interval: Duration) -> Self {
        self.options.sample_interval = interval;
        self
    }

    /// Heartbeat log interval
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.options.heartbeat_interval = interval;
        self
    }

    /// Destination size poll interval during restores
    pub fn restore_poll_interval(mut self, interval: Duration) -> Self {
        self.options.restore_poll_interval = interval;
        self
    }

    /// Reconciliation interval for re-attached snapshots
    pub fn reconcile_interval(mut self, interval: Duration) -> Self {
        self.options.reconcile_interval = interval;
        self
    }

    /// Grace period between SIGTERM and SIGKILL
    pub fn kill_grace(mut self, grace: Duration) -> Self {
        self.options.kill_grace = grace;
        self
    }

    /// Age after which a completed-but-unreconciled snapshot is finalized
    pub fn finalize_max_age(mut self, age: Duration) -> Self {
        self.options.finalize_max_age = age;
        self
    }

    /// Image for helper containers
    pub fn helper_image(mut self, image: impl Into<String>) -> Self {
        self.options.helper_image = image.into();
        self
    }

    /// Container runtime executable used when no runtime is supplied
    pub fn runtime_exe(mut self, exe: impl Into<String>) -> Self {
        self.options.runtime_exe = exe.into();
        self
    }

    /// Build the engine
    pub fn build(self) -> Result<SnapshotEngine> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Arc::new(CliRuntime::new(
                self.options.runtime_exe.clone(),
                self.options.helper_image.clone(),
            )),
        };
        Ok(SnapshotEngine {
            config: ConfigHandle::new(self.store),
            runtime,
            options: self.options,
            current: Mutex::new(None),
            attached: Mutex::new(Vec::new()),
        })
    }
}
