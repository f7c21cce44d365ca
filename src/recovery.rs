//! Startup recovery
//!
//! After an ungraceful exit the snapshot root and the configuration
//! document can disagree. [`SnapshotEngine::recover`] reconciles them once
//! at startup, before any new operation:
//!
//! 1. reclaim a lock whose owning process is gone, rolling back an
//!    interrupted bind restore from its `backup-*` directory
//! 2. finalize snapshots that reached `.complete` but were never cleaned up
//!    ([`SnapshotEngine::quick_finalize`])
//! 3. drop progress records whose snapshot directory has vanished
//!
//! Snapshots still being written by an orphaned helper can then be followed
//! with [`SnapshotEngine::attach_to_in_progress`]. No single source of truth
//! is trusted: markers, the progress record and the helper's liveness are
//! combined, and any of them may be missing.

use crate::catalog::{Artifact, Catalog};
use crate::config::ConfigHandle;
use crate::engine::{Attachment, SnapshotEngine};
use crate::error::Result;
use crate::lock::LockCoordinator;
use crate::markers;
use crate::progress;
use crate::restore;
use crate::retention;
use crate::runtime::ContainerRuntime;
use crate::types::{AttachCallback, LockReason, SnapshotInProgress};
use crate::utils;
use std::collections::HashSet;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, instrument, warn};

const STAGE: &str = "recovery.reconcile";

/// What [`SnapshotEngine::recover`] changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Reason of a lock reclaimed from a dead process
    pub reclaimed_lock: Option<LockReason>,
    /// Destination rolled back from an interrupted bind restore
    pub rolled_back: Option<PathBuf>,
    /// Snapshots finalized by [`SnapshotEngine::quick_finalize`]
    pub finalized: Vec<String>,
    /// Progress records dropped because their directory is gone
    pub pruned: Vec<String>,
}

/// Remove every marker and the progress record of a finished snapshot
fn finalize(config: &ConfigHandle, catalog: &Catalog, id: &str) -> Result<()> {
    let dir = catalog.snapshot_dir(id);
    markers::clear(&dir, markers::IN_PROGRESS)?;
    markers::clear(&dir, markers::BIND_ACTIVE)?;
    markers::clear(&dir, markers::COMPLETE)?;
    config.remove_record(id)?;
    info!(stage = STAGE, "Finalized snapshot {}", id);
    Ok(())
}

fn enforce_retention(config: &ConfigHandle, catalog: &Catalog, lock: &LockCoordinator) {
    let max_count = match config.read() {
        Ok(settings) => settings.snapshot_max_count,
        Err(e) => {
            warn!(stage = STAGE, "Skipping retention: {}", e);
            return;
        }
    };
    if let Err(e) = retention::enforce(catalog, lock, max_count, false, &HashSet::new()) {
        warn!(stage = STAGE, "Retention failed: {}", e);
    }
}

fn artifact_age(dir: &Path) -> Option<Duration> {
    let path = Artifact::resolve(dir).map(|a| a.path().to_path_buf()).unwrap_or_else(|| dir.to_path_buf());
    let modified = utils::newest_mtime(&path)?;
    Some(SystemTime::now().duration_since(modified).unwrap_or_default())
}

/// Process writing a snapshot's artifact
#[derive(Debug, Clone, PartialEq, Eq)]
enum Producer {
    /// Helper container; it keeps running after the engine process dies
    Helper(String),
    /// Shell pipeline or file copy; it dies with the process that owns it
    Local(u32),
    Unknown,
}

impl Producer {
    fn of(dir: &Path, record: Option<&SnapshotInProgress>) -> Self {
        if let Some(container) = record.and_then(|r| r.container_id.as_deref()) {
            return Producer::Helper(container.to_string());
        }
        markers::read_bind_active(dir)
            .map(|m| m.pid)
            .or_else(|| record.and_then(|r| r.bind_pid))
            .map_or(Producer::Unknown, Producer::Local)
    }
}

/// Whether a local producer is gone for good
///
/// A live lock owner may still be about to mark the snapshot complete, so
/// the producer only counts as lost once the lock is free or stale.
fn local_producer_lost(lock: &LockCoordinator, pid: u32) -> bool {
    !utils::is_pid_alive(pid) && !(lock.is_held() && !lock.is_stale())
}

/// Remove a partial snapshot that can no longer be completed
fn discard(config: &ConfigHandle, catalog: &Catalog, id: &str) -> Result<()> {
    utils::remove_path(&catalog.snapshot_dir(id))?;
    config.remove_record(id)?;
    warn!(stage = STAGE, "Discarded partial snapshot {}, its producer died before completing", id);
    Ok(())
}

enum Verdict {
    Wait,
    Finalize,
    Discard,
}

impl SnapshotEngine {
    /// Reconcile on-disk state left by a previous process
    #[instrument(skip(self))]
    pub fn recover(&self) -> Result<RecoveryReport> {
        let catalog = self.catalog()?;
        let lock = self.lock_for(&catalog);
        let mut report = RecoveryReport::default();

        if lock.is_held() && lock.is_stale() {
            let record = lock.record();
            report.reclaimed_lock = record.as_ref().map(|r| r.reason);
            warn!(stage = STAGE, "Reclaiming lock left by dead process: {:?}", record);

            if let Some(record) = record.filter(|r| r.reason == LockReason::Restore) {
                if let Some(destination) = record.destination {
                    match record.backup {
                        // never moved aside, the destination is untouched
                        Some(backup) if !backup.exists() => {}
                        backup => {
                            restore::roll_back(&destination, backup.as_deref())?;
                            info!(stage = STAGE, "Rolled back interrupted restore of {:?}", destination);
                            report.rolled_back = Some(destination);
                        }
                    }
                }
            }
            lock.release();
        }
        for backup in restore::leftover_backups(catalog.root()) {
            warn!(stage = STAGE, "Leftover restore backup {:?} kept for manual inspection", backup);
        }

        report.finalized = self.quick_finalize(self.options.finalize_max_age)?;

        report.pruned = self.config.update(|settings| {
            let gone: Vec<String> = settings
                .snapshots_in_progress
                .keys()
                .filter(|id| !catalog.snapshot_dir(id).exists())
                .cloned()
                .collect();
            for id in &gone {
                settings.snapshots_in_progress.remove(id);
            }
            gone
        })?;
        if !report.pruned.is_empty() {
            info!(stage = STAGE, "Dropped stale progress records: {:?}", report.pruned);
        }

        Ok(report)
    }

    /// Finalize snapshots that carry both `.in-progress` and `.complete`
    ///
    /// Both markers and the progress record are removed. Only artifacts untouched for at least `max_age` are finalized; newer
    /// ones may still be settling. Returns the finalized ids.
    #[instrument(skip(self))]
    pub fn quick_finalize(&self, max_age: Duration) -> Result<Vec<String>> {
        let catalog = self.catalog()?;
        let lock = self.lock_for(&catalog);
        let mut finalized = Vec::new();

        for snapshot in catalog.list()? {
            let dir = &snapshot.path;
            if !markers::exists(dir, markers::IN_PROGRESS) || !markers::exists(dir, markers::COMPLETE) {
                continue;
            }
            match artifact_age(dir) {
                Some(age) if age >= max_age => {
                    finalize(&self.config, &catalog, &snapshot.id)?;
                    finalized.push(snapshot.id);
                }
                _ => debug!(stage = STAGE, "{} is still settling", snapshot.id),
            }
        }

        enforce_retention(&self.config, &catalog, &lock);
        Ok(finalized)
    }

    /// Follow snapshots still in progress from a previous process
    ///
    /// For each `.in-progress` directory with an artifact, a sampler reports
    /// `(id, bytes)` through `on_tick` and a reconciler finalizes the
    /// snapshot once `.complete` appears, or once its helper container is
    /// gone and the artifact size held still across two checks. Bind
    /// pipelines and copies die with the process that owned them, so an
    /// unfinished one whose producer is gone is discarded rather than
    /// finalized. Returns the ids now being followed.
    #[instrument(skip(self, on_tick))]
    pub fn attach_to_in_progress(&self, on_tick: AttachCallback) -> Result<Vec<String>> {
        let catalog = self.catalog()?;
        let settings = self.settings()?;
        let lock = self.lock_for(&catalog);
        let mut attached = Vec::new();

        for snapshot in catalog.list()? {
            let id = snapshot.id.clone();
            let dir = snapshot.path.clone();
            if !markers::exists(&dir, markers::IN_PROGRESS) {
                continue;
            }
            if self.current_operation().is_some_and(|(current, _)| current == id)
                || self.attached.lock().iter().any(|a| a.id == id)
            {
                continue;
            }
            if Artifact::resolve(&dir).is_none() {
                debug!(stage = STAGE, "{} has no artifact yet, not attaching", id);
                continue;
            }

            let record = settings.snapshots_in_progress.get(&id).cloned();
            if !markers::exists(&dir, markers::COMPLETE) {
                match Producer::of(&dir, record.as_ref()) {
                    Producer::Local(pid) if local_producer_lost(&lock, pid) => {
                        discard(&self.config, &catalog, &id)?;
                        continue;
                    }
                    Producer::Unknown => {
                        warn!(stage = STAGE, "No producer recorded for {}, not attaching", id);
                        continue;
                    }
                    _ => {}
                }
            }

            let attachment = self.follow(&catalog, &id, dir, record, Arc::clone(&on_tick));
            self.attached.lock().push(attachment);
            info!(stage = STAGE, "Attached to in-progress snapshot {}", id);
            attached.push(id);
        }

        Ok(attached)
    }

    fn follow(
        &self,
        catalog: &Catalog,
        id: &str,
        dir: PathBuf,
        record: Option<SnapshotInProgress>,
        on_tick: AttachCallback,
    ) -> Attachment {
        let sampler = {
            let config = self.config.clone();
            let id = id.to_string();
            let dir = dir.clone();
            progress::every("attach-sampler", self.options.sample_interval, move || {
                if !markers::exists(&dir, markers::IN_PROGRESS) {
                    return ControlFlow::Break(());
                }
                let bytes = Artifact::resolve(&dir).map(|a| a.size()).unwrap_or(0);
                on_tick(&id, bytes);
                if let Err(e) = config.record_size(&id, bytes) {
                    debug!("Failed to record size for {}: {}", id, e);
                }
                ControlFlow::Continue(())
            })
        };

        let reconciler = {
            let config = self.config.clone();
            let runtime: Arc<dyn ContainerRuntime> = Arc::clone(&self.runtime);
            let catalog = catalog.clone();
            let lock = self.lock_for(&catalog);
            let id = id.to_string();
            let producer = Producer::of(&dir, record.as_ref());
            let mut last_size: Option<u64> = None;
            progress::every("reconcile", self.options.reconcile_interval, move || {
                if !markers::exists(&dir, markers::IN_PROGRESS) {
                    debug!(stage = STAGE, "{} finalized elsewhere", id);
                    return ControlFlow::Break(());
                }

                let verdict = if markers::exists(&dir, markers::COMPLETE) {
                    Verdict::Finalize
                } else {
                    match &producer {
                        Producer::Helper(container) => {
                            let size = Artifact::resolve(&dir).map(|a| a.size()).unwrap_or(0);
                            let stable = last_size == Some(size);
                            last_size = Some(size);
                            if stable && !runtime.is_running(container).unwrap_or(false) {
                                info!(stage = STAGE, "Helper of {} is gone and its artifact is stable", id);
                                Verdict::Finalize
                            } else {
                                Verdict::Wait
                            }
                        }
                        Producer::Local(pid) if local_producer_lost(&lock, *pid) => Verdict::Discard,
                        _ => Verdict::Wait,
                    }
                };

                let done = match verdict {
                    Verdict::Wait => return ControlFlow::Continue(()),
                    Verdict::Finalize => finalize(&config, &catalog, &id),
                    Verdict::Discard => discard(&config, &catalog, &id),
                };
                if let Err(e) = done {
                    warn!(stage = STAGE, "Failed to settle {}: {}", id, e);
                    return ControlFlow::Continue(());
                }
                enforce_retention(&config, &catalog, &lock);
                ControlFlow::Break(())
            })
        };

        Attachment {
            id: id.to_string(),
            sampler,
            reconciler,
        }
    }
}
