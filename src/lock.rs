//! File-backed engine lock
//!
//! A single `.lock` file at the snapshot root marks the engine as busy. It is
//! created with `O_EXCL` semantics so two processes can never both believe
//! they acquired it, and it survives restarts so a new process still sees an
//! interrupted operation as busy until recovery reclaims it.

use crate::error::{FsContext, Result, SnapshotError};
use crate::types::{LockReason, LockRecord};
use crate::utils;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Lock file name at the snapshot root
pub const LOCK_FILE: &str = ".lock";

/// Coordinator for the `.lock` file under one snapshot root
#[derive(Debug, Clone)]
pub struct LockCoordinator {
    path: PathBuf,
}

impl LockCoordinator {
    /// Coordinator for the lock under `root`
    pub fn new(root: &Path) -> Self {
        Self {
            path: root.join(LOCK_FILE),
        }
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the lock for `reason`
    ///
    /// The returned guard releases the lock when dropped.
    ///
    /// # Errors
    ///
    /// - [`SnapshotError::Busy`] naming the current holder's reason
    pub fn try_acquire(&self, reason: LockReason) -> Result<LockGuard> {
        if let Some(root) = self.path.parent() {
            fs::create_dir_all(root).fs_context("create snapshot root", root)?;
        }

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let held = self.reason().unwrap_or(LockReason::Unknown);
                warn!("Lock already held ({}), refusing {}", held, reason);
                return Err(SnapshotError::Busy { reason: held });
            }
            Err(e) => return Err(SnapshotError::filesystem("create lock", &self.path, e)),
        };

        let record = LockRecord {
            reason,
            started_at: utils::now_ms(),
            pid: Some(std::process::id()),
            destination: None,
            backup: None,
        };
        let written = serde_json::to_vec(&record)
            .map_err(SnapshotError::from)
            .and_then(|json| file.write_all(&json).fs_context("write lock", &self.path));
        if let Err(e) = written {
            self.release();
            return Err(e);
        }

        info!("Acquired lock for {}", reason);
        Ok(LockGuard {
            coordinator: self.clone(),
            active: true,
        })
    }

    /// Delete the lock file; never fails
    pub fn release(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Released lock {:?}", self.path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to release lock {:?}: {}", self.path, e),
        }
    }

    /// Whether the lock file exists
    pub fn is_held(&self) -> bool {
        self.path.exists()
    }

    /// Reason of the current holder
    ///
    /// `None` when unlocked, [`LockReason::Unknown`] when the file cannot be
    /// parsed.
    pub fn reason(&self) -> Option<LockReason> {
        let bytes = fs::read(&self.path).ok()?;
        Some(
            serde_json::from_slice::<LockRecord>(&bytes)
                .map(|r| r.reason)
                .unwrap_or(LockReason::Unknown),
        )
    }

    /// Full lock record, `None` when unlocked or unreadable
    pub fn record(&self) -> Option<LockRecord> {
        let bytes = fs::read(&self.path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Rewrite the current record in place
    pub fn update(&self, f: impl FnOnce(&mut LockRecord)) -> Result<()> {
        let mut record = self
            .record()
            .ok_or_else(|| SnapshotError::internal("lock is not held"))?;
        f(&mut record);
        utils::atomic_write(&self.path, &serde_json::to_vec(&record)?)
    }

    /// Whether the lock is held by a process that no longer exists
    ///
    /// Records without a pid are never considered stale.
    pub fn is_stale(&self) -> bool {
        self.record()
            .and_then(|r| r.pid)
            .is_some_and(|pid| !utils::is_pid_alive(pid))
    }
}

/// Releases the lock when dropped
#[derive(Debug)]
pub struct LockGuard {
    coordinator: LockCoordinator,
    active: bool,
}

impl LockGuard {
    /// The coordinator this guard belongs to
    pub fn coordinator(&self) -> &LockCoordinator {
        &self.coordinator
    }

    /// Release now instead of on drop
    pub fn release(mut self) {
        self.active = false;
        self.coordinator.release();
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.active {
            self.coordinator.release();
        }
    }
}
