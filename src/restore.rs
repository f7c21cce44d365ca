//! Snapshot restoration
//!
//! Restores always run under the `restore` lock, which also pauses
//! retention so the snapshot being read cannot be deleted underneath.
//!
//! Bind-mount destinations are moved aside to `<root>/backup-<ts>` before
//! extraction. The backup and destination paths are written into the lock
//! record first, so a crash at any point can be rolled back by
//! [`SnapshotEngine::recover`]. On failure the half-written destination is
//! removed and the backup moved back; on success the backup is deleted.
//!
//! Volume destinations are emptied and refilled by helper containers; there
//! is no backup for them.

use crate::catalog::{Artifact, Catalog, BACKUP_PREFIX};
use crate::engine::SnapshotEngine;
use crate::error::{FsContext, Result, SnapshotError};
use crate::lock::LockCoordinator;
use crate::markers;
use crate::pipeline::ShellPipeline;
use crate::progress::{self, Ticker};
use crate::runtime::HelperTask;
use crate::types::{LockReason, Snapshot, StorageDescriptor, StorageKind};
use crate::utils;
use std::fs;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

const VOLUME_STAGE: &str = "restore.volume.extract";
const BIND_STAGE: &str = "restore.bind.extract";

impl SnapshotEngine {
    /// Restore snapshot `id` into `storage`
    ///
    /// Cancel a running restore with [`SnapshotEngine::cancel_current`]. A
    /// cancelled or failed bind restore leaves the destination exactly as it
    /// was before the call.
    ///
    /// # Errors
    ///
    /// - [`SnapshotError::Busy`] if another creation or restoration runs
    /// - [`SnapshotError::NotFound`] for unknown or unfinished snapshots
    /// - [`SnapshotError::Pipeline`] if extraction fails
    #[instrument(skip(self), fields(kind = %storage.kind))]
    pub fn restore_snapshot(&self, id: &str, storage: &StorageDescriptor) -> Result<()> {
        let settings = self.settings()?;
        let catalog = Catalog::open(settings.root()?)?;
        let lock = self.lock_for(&catalog);
        let guard = lock.try_acquire(LockReason::Restore)?;
        let cancel = CancellationToken::new();
        let _slot = self.register(id, LockReason::Restore, cancel.clone());

        let result = self.restore_locked(&catalog, &lock, id, storage, &cancel);
        match &result {
            Ok(()) => info!("Restored snapshot {} into {}", id, storage.path),
            Err(e) if e.is_cancelled() => warn!("Restore of {} cancelled", id),
            Err(e) => error!("Restore of {} failed: {}", id, e),
        }
        guard.release();
        result
    }

    fn restore_locked(
        &self,
        catalog: &Catalog,
        lock: &LockCoordinator,
        id: &str,
        storage: &StorageDescriptor,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let snapshot = catalog.find(id)?;
        if catalog.is_in_progress(id) {
            return Err(SnapshotError::NotFound(format!("{} (still in progress)", id)));
        }
        let artifact = Artifact::resolve(&snapshot.path)
            .ok_or_else(|| SnapshotError::NotFound(format!("{} (no artifact)", id)))?;
        info!("Restoring {} from {:?}", id, artifact.path());

        match storage.kind {
            StorageKind::Volume => self.restore_volume(&snapshot, &artifact, &storage.path, cancel),
            StorageKind::Bind => self.restore_bind(catalog, lock, &snapshot, &artifact, Path::new(&storage.path), cancel),
        }
    }

    fn restore_volume(&self, snapshot: &Snapshot, artifact: &Artifact, volume: &str, cancel: &CancellationToken) -> Result<()> {
        self.run_helper(
            &HelperTask::Empty {
                volume: volume.to_string(),
            },
            &snapshot.id,
            cancel,
            |_| Ok(()),
        )?;

        let task = match artifact {
            Artifact::Compressed(path) | Artifact::Tar(path) => HelperTask::Extract {
                volume: volume.to_string(),
                archive: utils::absolute(path),
                compressed: artifact.is_compressed(),
            },
            Artifact::Tree(path) => HelperTask::CopyTree {
                volume: volume.to_string(),
                source_dir: utils::absolute(path),
            },
        };

        let poll = {
            let runtime = Arc::clone(&self.runtime);
            let volume = volume.to_string();
            let total = snapshot.size_bytes;
            progress::every("restore-poll", self.options.restore_poll_interval, move || {
                match runtime.volume_usage(&volume) {
                    Ok(bytes) => info!(
                        stage = VOLUME_STAGE,
                        "Restored {} so far (snapshot is {})",
                        utils::format_bytes(bytes),
                        utils::format_bytes(total)
                    ),
                    Err(e) => warn!(stage = VOLUME_STAGE, "Size poll failed: {}", e),
                }
                ControlFlow::Continue(())
            })
        };
        let heartbeat = self.restore_heartbeat(&snapshot.id, VOLUME_STAGE);

        let result = self.run_helper(&task, &snapshot.id, cancel, |_| Ok(()));
        poll.stop();
        heartbeat.stop();
        result
    }

    fn restore_bind(
        &self,
        catalog: &Catalog,
        lock: &LockCoordinator,
        snapshot: &Snapshot,
        artifact: &Artifact,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let destination = utils::absolute(destination);
        let backup = catalog.root().join(format!("{}{}", BACKUP_PREFIX, utils::now_ms()));
        let had_existing = destination.exists();

        lock.update(|record| {
            record.destination = Some(destination.clone());
            record.backup = had_existing.then(|| backup.clone());
        })?;

        if had_existing {
            info!("Moving {:?} aside to {:?}", destination, backup);
            utils::move_dir(&destination, &backup)?;
        }

        let result = fs::create_dir_all(&destination)
            .fs_context("create destination", &destination)
            .and_then(|_| self.extract_bind(snapshot, artifact, &destination, cancel));

        match result {
            Ok(()) => {
                if had_existing {
                    if let Err(e) = utils::remove_path(&backup) {
                        warn!("Restore succeeded but backup {:?} could not be removed: {}", backup, e);
                    }
                }
                Ok(())
            }
            Err(e) => {
                let previous = had_existing.then_some(backup.as_path());
                if let Err(rollback) = roll_back(&destination, previous) {
                    error!(
                        "Rollback of {:?} failed: {} (previous content kept at {:?})",
                        destination, rollback, backup
                    );
                } else {
                    info!("Rolled back {:?} to its previous content", destination);
                }
                Err(e)
            }
        }
    }

    fn extract_bind(&self, snapshot: &Snapshot, artifact: &Artifact, destination: &Path, cancel: &CancellationToken) -> Result<()> {
        let heartbeat = self.restore_heartbeat(&snapshot.id, BIND_STAGE);
        let poll = {
            let destination = destination.to_path_buf();
            progress::sample_size(destination, self.options.restore_poll_interval, |bytes| {
                info!(stage = BIND_STAGE, "Restored {} so far", utils::format_bytes(bytes));
            })
        };

        let result = match artifact {
            Artifact::Compressed(path) | Artifact::Tar(path) => {
                ShellPipeline::extract(BIND_STAGE, path, destination, artifact.is_compressed())
                    .grace(self.options.kill_grace)
                    .run(cancel)
                    .map_err(|e| match e {
                        SnapshotError::Cancelled(_) => SnapshotError::Cancelled(snapshot.id.clone()),
                        other => other,
                    })
            }
            Artifact::Tree(path) => utils::copy_tree(path, destination, &markers::is_marker, Some(cancel))
                .map(|files| info!(stage = BIND_STAGE, "Copied {} files", files))
                .map_err(|e| match e {
                    SnapshotError::Cancelled(_) => SnapshotError::Cancelled(snapshot.id.clone()),
                    other => other,
                }),
        };

        poll.stop();
        heartbeat.stop();
        result
    }

    fn restore_heartbeat(&self, id: &str, stage: &'static str) -> Ticker {
        let id = id.to_string();
        progress::heartbeat(self.options.heartbeat_interval, move |elapsed| {
            info!(stage, "Still restoring {} ({}s elapsed)", id, elapsed.as_secs());
        })
    }
}

/// Remove a half-written destination and move `backup` back into place
///
/// With no backup the destination did not exist before and is only removed.
pub(crate) fn roll_back(destination: &Path, backup: Option<&Path>) -> Result<()> {
    utils::remove_path(destination)?;
    if let Some(backup) = backup {
        utils::move_dir(backup, destination)?;
    }
    Ok(())
}

/// Backup directories left under the snapshot root
pub(crate) fn leftover_backups(root: &Path) -> Vec<PathBuf> {
    fs::read_dir(root)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().starts_with(BACKUP_PREFIX))
                .map(|e| e.path())
                .collect()
        })
        .unwrap_or_default()
}
