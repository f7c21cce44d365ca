//! Configuration document and engine tuning
//!
//! The engine shares one structured document with the surrounding
//! application. Only the `snapshot*` fields belong to the engine; everything
//! else is carried through untouched so a save never drops foreign settings.
//!
//! ```json
//! {
//!   "snapshotPath": "/home/user/.vm/snapshots",
//!   "snapshotCompression": true,
//!   "snapshotMaxCount": 2,
//!   "snapshotsInProgress": {
//!     "1700000000000-before_update": {
//!       "name": "before update",
//!       "timestamp": 1700000000000,
//!       "currentSize": 104857600,
//!       "containerId": "3f2a..."
//!     }
//!   },
//!   "theme": "dark"
//! }
//! ```
//!
//! Writers always read-modify-write the whole document through
//! [`ConfigHandle`], which serializes updates so samplers running on
//! background threads never race a foreground operation.

use crate::error::{FsContext, Result, SnapshotError};
use crate::types::SnapshotInProgress;
use crate::utils;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Default number of completed snapshots to keep
pub const DEFAULT_MAX_COUNT: u32 = 2;

fn default_compression() -> bool {
    true
}

fn default_max_count() -> u32 {
    DEFAULT_MAX_COUNT
}

/// Engine-owned part of the configuration document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSettings {
    /// Snapshot root directory
    #[serde(default)]
    pub snapshot_path: PathBuf,
    /// Compress new snapshots
    #[serde(default = "default_compression")]
    pub snapshot_compression: bool,
    /// Maximum number of completed snapshots; `0` keeps everything
    #[serde(default = "default_max_count")]
    pub snapshot_max_count: u32,
    /// Snapshots currently being produced, keyed by id
    #[serde(default)]
    pub snapshots_in_progress: BTreeMap<String, SnapshotInProgress>,
    /// Fields owned by the surrounding application
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self {
            snapshot_path: PathBuf::new(),
            snapshot_compression: default_compression(),
            snapshot_max_count: DEFAULT_MAX_COUNT,
            snapshots_in_progress: BTreeMap::new(),
            extra: serde_json::Map::new(),
        }
    }
}

impl SnapshotSettings {
    /// Settings rooted at `snapshot_path` with every other field defaulted
    pub fn with_root(snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            snapshot_path: snapshot_path.into(),
            ..Default::default()
        }
    }

    /// Snapshot root, failing when unset
    pub fn root(&self) -> Result<&Path> {
        if self.snapshot_path.as_os_str().is_empty() {
            return Err(SnapshotError::config("snapshotPath is not set"));
        }
        Ok(&self.snapshot_path)
    }
}

/// Persistence backend for the configuration document
///
/// Implementations must make `save` atomic: a concurrent `load` sees either
/// the old or the new document.
pub trait ConfigStore: Send + Sync {
    /// Read the whole document
    fn load(&self) -> Result<SnapshotSettings>;

    /// Replace the whole document
    fn save(&self, settings: &SnapshotSettings) -> Result<()>;
}

/// JSON file store
#[derive(Debug, Clone)]
pub struct JsonConfigStore {
    path: PathBuf,
}

impl JsonConfigStore {
    /// Store backed by the JSON file at `path` (created on first save)
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for JsonConfigStore {
    fn load(&self) -> Result<SnapshotSettings> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No configuration at {:?}, using defaults", self.path);
                return Ok(SnapshotSettings::default());
            }
            Err(e) => return Err(SnapshotError::filesystem("read config", &self.path, e)),
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| SnapshotError::config(format!("{}: {}", self.path.display(), e)))
    }

    fn save(&self, settings: &SnapshotSettings) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).fs_context("create config directory", parent)?;
        }
        let json = serde_json::to_vec_pretty(settings)?;
        utils::atomic_write(&self.path, &json)
    }
}

/// In-memory store for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    document: Mutex<SnapshotSettings>,
}

impl MemoryConfigStore {
    /// Store holding `settings`
    pub fn new(settings: SnapshotSettings) -> Self {
        Self {
            document: Mutex::new(settings),
        }
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self) -> Result<SnapshotSettings> {
        Ok(self.document.lock().clone())
    }

    fn save(&self, settings: &SnapshotSettings) -> Result<()> {
        *self.document.lock() = settings.clone();
        Ok(())
    }
}

/// Shared, serialized access to a [`ConfigStore`]
#[derive(Clone)]
pub struct ConfigHandle {
    store: Arc<dyn ConfigStore>,
    write_lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for ConfigHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigHandle").finish_non_exhaustive()
    }
}

impl ConfigHandle {
    /// Wrap a store
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self {
            store,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Current document
    pub fn read(&self) -> Result<SnapshotSettings> {
        self.store.load()
    }

    /// Read-modify-write the whole document
    ///
    /// The closure's return value is passed through. Updates from different
    /// threads are applied one after another, never interleaved.
    pub fn update<R>(&self, f: impl FnOnce(&mut SnapshotSettings) -> R) -> Result<R> {
        let _guard = self.write_lock.lock();
        let mut settings = self.store.load()?;
        let out = f(&mut settings);
        self.store.save(&settings)?;
        Ok(out)
    }

    /// Insert or replace a progress record
    pub fn put_record(&self, id: &str, record: SnapshotInProgress) -> Result<()> {
        self.update(|s| {
            s.snapshots_in_progress.insert(id.to_string(), record);
        })
    }

    /// Mutate an existing progress record; absent records are left absent
    pub fn update_record(&self, id: &str, f: impl FnOnce(&mut SnapshotInProgress)) -> Result<bool> {
        self.update(|s| match s.snapshots_in_progress.get_mut(id) {
            Some(record) => {
                f(record);
                true
            }
            None => false,
        })
    }

    /// Record the latest sampled size
    pub fn record_size(&self, id: &str, bytes: u64) -> Result<()> {
        trace!("Recording size {} for {}", bytes, id);
        self.update_record(id, |r| r.current_size = bytes).map(|_| ())
    }

    /// Drop a progress record
    pub fn remove_record(&self, id: &str) -> Result<bool> {
        self.update(|s| s.snapshots_in_progress.remove(id).is_some())
    }
}

/// Tuning knobs for timers, cancellation and helper containers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    /// How often the artifact size is sampled
    pub sample_interval: Duration,
    /// How often a liveness line is logged
    pub heartbeat_interval: Duration,
    /// How often the destination size is logged during a volume restore
    pub restore_poll_interval: Duration,
    /// How often re-attached snapshots are reconciled
    pub reconcile_interval: Duration,
    /// Wait between the graceful and the forced kill
    pub kill_grace: Duration,
    /// Age after which a `.complete` artifact is considered settled
    pub finalize_max_age: Duration,
    /// Image used for helper containers
    pub helper_image: String,
    /// Container runtime executable
    pub runtime_exe: String,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(10),
            restore_poll_interval: Duration::from_secs(10),
            reconcile_interval: Duration::from_secs(5),
            kill_grace: Duration::from_millis(1500),
            finalize_max_age: Duration::from_secs(30),
            helper_image: "alpine".to_string(),
            runtime_exe: "docker".to_string(),
        }
    }
}
