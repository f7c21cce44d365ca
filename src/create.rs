//! Snapshot creation
//!
//! A creation runs in these steps, all under the `snapshot` lock:
//!
//! 1. create `<root>/<id>/` with `.in-progress` and a progress record
//! 2. free a retention slot for the new snapshot
//! 3. write the artifact: a helper container for volumes, a local
//!    `tar | pigz` pipeline or a file-by-file copy for bind mounts
//! 4. on success write `.complete`, clear `.in-progress`, re-run retention
//!    and drop the progress record
//!
//! Any failure or cancellation removes the markers, the record and the
//! partial directory. The lock is released in every case.

use crate::catalog::{Catalog, COMPRESSED_ARTIFACT, TAR_ARTIFACT};
use crate::engine::SnapshotEngine;
use crate::error::{FsContext, Result, SnapshotError};
use crate::lock::LockCoordinator;
use crate::markers;
use crate::pipeline::ShellPipeline;
use crate::progress;
use crate::retention;
use crate::runtime::HelperTask;
use crate::types::{
    BindActive, LockReason, ProgressCallback, Snapshot, SnapshotInProgress, StorageDescriptor, StorageKind,
};
use crate::utils;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

struct CreatePlan<'a> {
    id: &'a str,
    dir: PathBuf,
    storage: &'a StorageDescriptor,
    compress: bool,
}

impl CreatePlan<'_> {
    fn artifact_path(&self) -> PathBuf {
        match (self.storage.kind, self.compress) {
            (_, true) => self.dir.join(COMPRESSED_ARTIFACT),
            (StorageKind::Volume, false) => self.dir.join(TAR_ARTIFACT),
            (StorageKind::Bind, false) => self.dir.clone(),
        }
    }

    fn stage(&self) -> &'static str {
        match (self.storage.kind, self.compress) {
            (StorageKind::Volume, _) => "snapshot.volume.export",
            (StorageKind::Bind, true) => "snapshot.bind.compress",
            (StorageKind::Bind, false) => "snapshot.bind.copy",
        }
    }
}

impl SnapshotEngine {
    /// Create a snapshot of `storage`
    ///
    /// `on_progress` receives the artifact size every sample interval.
    /// `id_hint` overrides the generated `<timestamp>-<name>` id; it must
    /// have the same shape.
    ///
    /// # Errors
    ///
    /// - [`SnapshotError::Busy`] if another creation or restoration runs
    /// - [`SnapshotError::Cancelled`] if `cancel` fires
    /// - [`SnapshotError::Pipeline`] if the archiver exits unsuccessfully
    #[instrument(skip(self, on_progress, cancel), fields(kind = %storage.kind))]
    pub fn create_snapshot(
        &self,
        name: &str,
        storage: &StorageDescriptor,
        on_progress: Option<ProgressCallback>,
        cancel: &CancellationToken,
        id_hint: Option<&str>,
    ) -> Result<Snapshot> {
        if name.trim().is_empty() {
            return Err(SnapshotError::InvalidName(name.to_string()));
        }
        let (id, timestamp) = match id_hint {
            Some(hint) => {
                let (ts, _) = utils::parse_snapshot_id(hint)
                    .ok_or_else(|| SnapshotError::InvalidName(hint.to_string()))?;
                (hint.to_string(), ts)
            }
            None => {
                let ts = utils::now_ms();
                (utils::snapshot_id(ts, name), ts)
            }
        };

        let settings = self.settings()?;
        let catalog = Catalog::open(settings.root()?)?;
        let lock = self.lock_for(&catalog);
        let guard = lock.try_acquire(LockReason::Snapshot)?;
        let _slot = self.register(&id, LockReason::Snapshot, cancel.clone());

        let dir = catalog.snapshot_dir(&id);
        if dir.exists() {
            return Err(SnapshotError::InvalidName(format!("{} already exists", id)));
        }
        fs::create_dir_all(&dir).fs_context("create snapshot directory", &dir)?;
        info!("Creating snapshot {} ({}) at {:?}", id, name, dir);

        let plan = CreatePlan {
            id: &id,
            dir,
            storage,
            compress: settings.snapshot_compression,
        };

        let result = markers::touch(&plan.dir, markers::IN_PROGRESS)
            .and_then(|_| {
                self.config.put_record(
                    &id,
                    SnapshotInProgress {
                        name: name.to_string(),
                        timestamp,
                        ..Default::default()
                    },
                )
            })
            .and_then(|_| {
                retention::enforce(&catalog, &lock, settings.snapshot_max_count, true, &HashSet::new())
            })
            .and_then(|_| self.produce(&plan, on_progress, cancel));

        let outcome = match result {
            Ok(()) => self.finish(&catalog, &lock, &plan),
            Err(e) => {
                self.discard(&plan);
                if e.is_cancelled() {
                    warn!("Snapshot {} cancelled", id);
                    Err(SnapshotError::Cancelled(id.clone()))
                } else {
                    error!(stage = plan.stage(), "Snapshot {} failed: {}", id, e);
                    Err(e)
                }
            }
        };
        guard.release();
        outcome
    }

    fn produce(&self, plan: &CreatePlan<'_>, on_progress: Option<ProgressCallback>, cancel: &CancellationToken) -> Result<()> {
        let sampler = {
            let config = self.config.clone();
            let id = plan.id.to_string();
            progress::sample_size(plan.artifact_path(), self.options.sample_interval, move |bytes| {
                if let Some(cb) = &on_progress {
                    cb(bytes);
                }
                if let Err(e) = config.record_size(&id, bytes) {
                    warn!("Failed to record progress for {}: {}", id, e);
                }
            })
        };
        let heartbeat = {
            let id = plan.id.to_string();
            let stage = plan.stage();
            progress::heartbeat(self.options.heartbeat_interval, move |elapsed| {
                info!(stage, "Still working on {} ({}s elapsed)", id, elapsed.as_secs());
            })
        };

        let result = match (plan.storage.kind, plan.compress) {
            (StorageKind::Volume, compress) => self.export_volume(plan, compress, cancel),
            (StorageKind::Bind, true) => self.compress_bind(plan, cancel),
            (StorageKind::Bind, false) => self.copy_bind(plan, cancel),
        };

        sampler.stop();
        heartbeat.stop();
        result
    }

    fn export_volume(&self, plan: &CreatePlan<'_>, compress: bool, cancel: &CancellationToken) -> Result<()> {
        let task = HelperTask::Archive {
            volume: plan.storage.path.clone(),
            destination_dir: utils::absolute(&plan.dir),
            compress,
        };
        self.run_helper(&task, plan.id, cancel, |container| {
            self.config
                .update_record(plan.id, |r| r.container_id = Some(container.to_string()))
                .map(|_| ())
        })
    }

    fn compress_bind(&self, plan: &CreatePlan<'_>, cancel: &CancellationToken) -> Result<()> {
        let source = bind_source(plan.storage)?;
        let artifact = plan.artifact_path();
        let pipeline = ShellPipeline::archive(plan.stage(), &source, &artifact).grace(self.options.kill_grace);
        let mut running = pipeline.spawn()?;
        let pid = running.pid();

        let recorded = markers::write_bind_active(
            &plan.dir,
            &BindActive {
                pid,
                started_at: utils::now_ms(),
                cmd: pipeline.script().to_string(),
                snapshot_id: plan.id.to_string(),
                artifact_path: artifact,
            },
        )
        .and_then(|_| {
            self.config.update_record(plan.id, |r| {
                r.bind_pid = Some(pid);
                r.bind_active = Some(true);
            })
        });
        if let Err(e) = recorded {
            running.terminate();
            return Err(e);
        }

        running.wait(cancel)
    }

    fn copy_bind(&self, plan: &CreatePlan<'_>, cancel: &CancellationToken) -> Result<()> {
        let source = bind_source(plan.storage)?;
        let pid = std::process::id();
        markers::write_bind_active(
            &plan.dir,
            &BindActive {
                pid,
                started_at: utils::now_ms(),
                cmd: BindActive::COPY_CMD.to_string(),
                snapshot_id: plan.id.to_string(),
                artifact_path: plan.dir.clone(),
            },
        )?;
        self.config.update_record(plan.id, |r| {
            r.bind_pid = Some(pid);
            r.bind_active = Some(true);
        })?;

        let files = utils::copy_tree(&source, &plan.dir, &markers::is_marker, Some(cancel))?;
        info!(stage = plan.stage(), "Copied {} files for {}", files, plan.id);
        Ok(())
    }

    fn finish(&self, catalog: &Catalog, lock: &LockCoordinator, plan: &CreatePlan<'_>) -> Result<Snapshot> {
        markers::touch(&plan.dir, markers::COMPLETE)?;
        markers::clear(&plan.dir, markers::IN_PROGRESS)?;
        markers::clear(&plan.dir, markers::BIND_ACTIVE)?;

        let max_count = self.settings().map(|s| s.snapshot_max_count)?;
        if let Err(e) = retention::enforce(catalog, lock, max_count, false, &HashSet::new()) {
            warn!("Retention after {} failed: {}", plan.id, e);
        }
        self.config.remove_record(plan.id)?;

        let snapshot = catalog.find(plan.id)?;
        info!(
            "Snapshot {} complete ({})",
            plan.id,
            utils::format_bytes(snapshot.size_bytes)
        );
        Ok(snapshot)
    }

    fn discard(&self, plan: &CreatePlan<'_>) {
        for marker in markers::ALL {
            if let Err(e) = markers::clear(&plan.dir, marker) {
                warn!("{}", e);
            }
        }
        if let Err(e) = self.config.remove_record(plan.id) {
            warn!("Failed to drop progress record for {}: {}", plan.id, e);
        }
        match utils::remove_path(&plan.dir) {
            Ok(_) => info!("Removed partial snapshot {}", plan.id),
            Err(e) => error!("Failed to remove partial snapshot {}: {}", plan.id, e),
        }
    }
}

fn bind_source(storage: &StorageDescriptor) -> Result<PathBuf> {
    let source = Path::new(&storage.path);
    let meta = fs::metadata(source).fs_context("read bind source", source)?;
    if !meta.is_dir() {
        return Err(SnapshotError::filesystem(
            "read bind source",
            source,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a directory"),
        ));
    }
    Ok(utils::absolute(source))
}
