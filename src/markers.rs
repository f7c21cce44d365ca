//! Marker files inside snapshot directories
//!
//! Markers are tiny sentinel files that durably record where a snapshot is in
//! its lifecycle, so a later process can tell "still writing" from "written
//! but never reconciled" after an ungraceful exit:
//!
//! | Marker         | Meaning                                                   |
//! |----------------|-----------------------------------------------------------|
//! | `.in-progress` | the directory exists but the operation has not finished   |
//! | `.complete`    | the producing process exited successfully                 |
//! | `.bind-active` | a bind-mount pipeline is running (JSON [`BindActive`])    |
//!
//! `.complete` is only written after a successful exit, and `.in-progress` is
//! only removed once `.complete` exists (or recovery has validated the
//! artifact).

use crate::error::{FsContext, Result};
use crate::types::BindActive;
use crate::utils;
use std::fs;
use std::path::Path;
use tracing::{trace, warn};

/// Operation has started but not finished
pub const IN_PROGRESS: &str = ".in-progress";
/// Artifact fully written by a successful producer
pub const COMPLETE: &str = ".complete";
/// Bind pipeline running, with JSON payload
pub const BIND_ACTIVE: &str = ".bind-active";

/// All marker names, for filtering them out of copied trees
pub const ALL: [&str; 3] = [IN_PROGRESS, COMPLETE, BIND_ACTIVE];

/// Whether a path relative to a snapshot directory is a marker file
pub fn is_marker(rel: &Path) -> bool {
    rel.parent().is_some_and(|p| p.as_os_str().is_empty())
        && rel.to_str().is_some_and(|name| ALL.contains(&name))
}

/// Whether `marker` exists in `dir`
pub fn exists(dir: &Path, marker: &str) -> bool {
    dir.join(marker).exists()
}

/// Create an empty marker
pub fn touch(dir: &Path, marker: &str) -> Result<()> {
    let path = dir.join(marker);
    fs::write(&path, b"").fs_context("write marker", &path)?;
    trace!("Wrote marker {:?}", path);
    Ok(())
}

/// Remove a marker; a missing marker is fine
pub fn clear(dir: &Path, marker: &str) -> Result<()> {
    let path = dir.join(marker);
    match fs::remove_file(&path) {
        Ok(()) => {
            trace!("Removed marker {:?}", path);
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(crate::SnapshotError::filesystem("remove marker", path, e)),
    }
}

/// Write the `.bind-active` payload atomically
pub fn write_bind_active(dir: &Path, payload: &BindActive) -> Result<()> {
    let json = serde_json::to_vec_pretty(payload)?;
    utils::atomic_write(&dir.join(BIND_ACTIVE), &json)
}

/// Read the `.bind-active` payload, tolerating absence and corruption
pub fn read_bind_active(dir: &Path) -> Option<BindActive> {
    let path = dir.join(BIND_ACTIVE);
    let bytes = fs::read(&path).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(payload) => Some(payload),
        Err(e) => {
            warn!("Ignoring unreadable marker {:?}: {}", path, e);
            None
        }
    }
}
