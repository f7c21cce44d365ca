//! Core data types shared across the engine
//!
//! ## Overview
//!
//! - **Catalog entries**: [`Snapshot`] describes one snapshot found on disk
//! - **Storage**: [`StorageDescriptor`] names the VM storage backend to
//!   capture or restore
//! - **Durable progress**: [`SnapshotInProgress`] is the record kept in the
//!   configuration document while a snapshot is being produced
//! - **Locking**: [`LockReason`] and [`LockRecord`] describe the on-disk lock
//! - **Markers**: [`BindActive`] is the payload of the `.bind-active` marker
//!
//! ## Examples
//!
//! ```rust
//! use coldsnap::types::{StorageDescriptor, StorageKind};
//!
//! let storage = StorageDescriptor::volume("vm-data");
//! assert_eq!(storage.kind, StorageKind::Volume);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// A snapshot found in the snapshot root directory
///
/// The id is `<timestamp>-<sanitized name>`; `name` is recovered from the id
/// with underscores turned back into spaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Directory (or file stem) name
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Creation time in milliseconds since the Unix epoch
    pub timestamp: i64,
    /// Artifact size, or the recursive size of a copied tree
    pub size_bytes: u64,
    /// Whether the artifact is gzip-compressed
    pub compressed: bool,
    /// Path of the snapshot directory (or file)
    pub path: PathBuf,
}

/// Kind of storage backend holding the VM disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// Volume managed by the container runtime
    Volume,
    /// Host directory bind-mounted into the container
    Bind,
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageKind::Volume => write!(f, "volume"),
            StorageKind::Bind => write!(f, "bind"),
        }
    }
}

/// Storage backend to snapshot from or restore into
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageDescriptor {
    /// Volume or bind mount
    pub kind: StorageKind,
    /// Volume name or host directory path
    pub path: String,
}

impl StorageDescriptor {
    /// Describe a runtime-managed volume
    pub fn volume(name: impl Into<String>) -> Self {
        Self {
            kind: StorageKind::Volume,
            path: name.into(),
        }
    }

    /// Describe a bind-mounted host directory
    pub fn bind(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: StorageKind::Bind,
            path: path.into().to_string_lossy().into_owned(),
        }
    }
}

/// Durable record of a snapshot being produced
///
/// Lives in the configuration document under `snapshotsInProgress`, keyed by
/// snapshot id, so that progress and process identifiers survive a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotInProgress {
    /// Human-readable name
    pub name: String,
    /// Creation time in milliseconds
    pub timestamp: i64,
    /// Last sampled artifact size
    #[serde(default)]
    pub current_size: u64,
    /// Helper container running the volume export
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    /// Leader pid of the local bind pipeline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_pid: Option<u32>,
    /// Whether a bind pipeline is running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_active: Option<bool>,
}

/// Why the engine lock is held
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockReason {
    /// A snapshot is being created
    Snapshot,
    /// A snapshot is being restored
    Restore,
    /// The lock file exists but cannot be parsed
    Unknown,
}

impl fmt::Display for LockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockReason::Snapshot => write!(f, "snapshot"),
            LockReason::Restore => write!(f, "restore"),
            LockReason::Unknown => write!(f, "unknown"),
        }
    }
}

/// Contents of the `.lock` file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    /// Operation holding the lock
    pub reason: LockReason,
    /// Acquisition time in milliseconds
    pub started_at: i64,
    /// Process that acquired the lock
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Bind restoration destination, for rollback after a crash
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<PathBuf>,
    /// Bind restoration backup directory, for rollback after a crash
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<PathBuf>,
}

/// Payload of the `.bind-active` marker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindActive {
    /// Pipeline leader pid (the engine's own pid for in-process copies)
    pub pid: u32,
    /// Start time in milliseconds
    pub started_at: i64,
    /// Pipeline description; [`BindActive::COPY_CMD`] for in-process copies
    pub cmd: String,
    /// Snapshot being produced
    pub snapshot_id: String,
    /// Artifact being written
    pub artifact_path: PathBuf,
}

impl BindActive {
    /// `cmd` value used for file-by-file copies run inside the engine process
    pub const COPY_CMD: &'static str = "copy";

    /// Whether the writer runs inside the engine process itself
    pub fn is_in_process_copy(&self) -> bool {
        self.cmd == Self::COPY_CMD
    }
}

/// Progress callback receiving the number of bytes written so far
pub type ProgressCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Callback used by re-attached samplers: snapshot id and bytes written
pub type AttachCallback = Arc<dyn Fn(&str, u64) + Send + Sync>;
