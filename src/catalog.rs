//! Snapshot catalog: what exists under the snapshot root
//!
//! The catalog is the source of truth for which snapshots exist. It never
//! caches anything; every call re-reads the directory, so it is safe to use
//! while a creation or restoration is running.
//!
//! ## On-disk layout
//!
//! ```text
//! snapshot_root/
//! ├── .lock                          # engine lock (see `lock`)
//! ├── 1700000000000-fresh_install/
//! │   ├── data.tar.gz                # compressed artifact, or
//! │   ├── data.tar                   # plain archive, or
//! │   ├── <copied tree...>           # uncompressed bind copy
//! │   ├── .in-progress               # markers (see `markers`)
//! │   └── .complete
//! ├── 1690000000000-legacy.tar.gz    # file-form snapshot
//! └── backup-1700000001234/          # restore backup, never a snapshot
//! ```

use crate::error::{FsContext, Result, SnapshotError};
use crate::markers;
use crate::types::Snapshot;
use crate::utils;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// Compressed archive name inside a snapshot directory
pub const COMPRESSED_ARTIFACT: &str = "data.tar.gz";
/// Uncompressed archive name inside a snapshot directory
pub const TAR_ARTIFACT: &str = "data.tar";
/// Prefix of restore backup directories
pub const BACKUP_PREFIX: &str = "backup-";

const FILE_FORM_SUFFIX: &str = ".tar.gz";

/// The concrete data that represents a snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    /// gzip-compressed tar archive
    Compressed(PathBuf),
    /// Plain tar archive
    Tar(PathBuf),
    /// Full directory copy of the source tree
    Tree(PathBuf),
}

impl Artifact {
    /// Resolve the artifact of a snapshot path
    ///
    /// Prefers `data.tar.gz`, then `data.tar`, then a copied tree. A
    /// directory holding nothing but marker files has no artifact yet.
    pub fn resolve(path: &Path) -> Option<Artifact> {
        let meta = fs::metadata(path).ok()?;
        if meta.is_file() {
            let compressed = path.to_string_lossy().ends_with(FILE_FORM_SUFFIX);
            return Some(if compressed {
                Artifact::Compressed(path.to_path_buf())
            } else {
                Artifact::Tar(path.to_path_buf())
            });
        }

        let gz = path.join(COMPRESSED_ARTIFACT);
        if gz.is_file() {
            return Some(Artifact::Compressed(gz));
        }
        let tar = path.join(TAR_ARTIFACT);
        if tar.is_file() {
            return Some(Artifact::Tar(tar));
        }

        let has_content = fs::read_dir(path)
            .ok()?
            .filter_map(|e| e.ok())
            .any(|e| !markers::ALL.contains(&e.file_name().to_string_lossy().as_ref()));
        has_content.then(|| Artifact::Tree(path.to_path_buf()))
    }

    /// Path of the archive file or tree root
    pub fn path(&self) -> &Path {
        match self {
            Artifact::Compressed(p) | Artifact::Tar(p) | Artifact::Tree(p) => p,
        }
    }

    /// Whether the artifact is gzip-compressed
    pub fn is_compressed(&self) -> bool {
        matches!(self, Artifact::Compressed(_))
    }

    /// Current size in bytes
    pub fn size(&self) -> u64 {
        utils::path_size(self.path())
    }
}

/// Read-side view of the snapshot root directory
#[derive(Debug, Clone)]
pub struct Catalog {
    root: PathBuf,
}

impl Catalog {
    /// Catalog over an existing (or not yet created) snapshot root
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Catalog over `root`, creating the directory if needed
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.exists() {
            fs::create_dir_all(&root).fs_context("create snapshot root", &root)?;
            info!("Created snapshots directory: {:?}", root);
        }
        Ok(Self { root })
    }

    /// Snapshot root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of a (possibly not yet existing) snapshot id
    pub fn snapshot_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// List all snapshots, newest first
    ///
    /// Skips `backup-*` entries and anything whose id does not match
    /// `<digits>-<name>`. Entries that disappear while being listed are
    /// skipped rather than reported as errors.
    #[instrument(skip(self), level = "debug")]
    pub fn list(&self) -> Result<Vec<Snapshot>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SnapshotError::filesystem("read snapshot root", &self.root, e)),
        };

        let mut snapshots = Vec::new();
        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name.starts_with(BACKUP_PREFIX) {
                continue;
            }

            let path = entry.path();
            let meta = match fs::metadata(&path) {
                Ok(meta) => meta,
                Err(e) => {
                    debug!("Skipping {:?}: {}", path, e);
                    continue;
                }
            };

            let (id, compressed) = if meta.is_dir() {
                (file_name.clone(), path.join(COMPRESSED_ARTIFACT).is_file())
            } else if let Some(stem) = file_name.strip_suffix(FILE_FORM_SUFFIX) {
                (stem.to_string(), true)
            } else {
                (file_name.clone(), false)
            };

            let Some((timestamp, name)) = utils::parse_snapshot_id(&id) else {
                continue;
            };

            let size_bytes = match Artifact::resolve(&path) {
                Some(artifact) => artifact.size(),
                None => utils::path_size(&path),
            };

            snapshots.push(Snapshot {
                id,
                name,
                timestamp,
                size_bytes,
                compressed,
                path,
            });
        }

        snapshots.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(snapshots)
    }

    /// Find a snapshot by id
    ///
    /// # Errors
    ///
    /// - [`SnapshotError::NotFound`] if no listed snapshot has this id
    pub fn find(&self, id: &str) -> Result<Snapshot> {
        self.list()?
            .into_iter()
            .find(|s| s.id == id)
            .ok_or_else(|| SnapshotError::NotFound(id.to_string()))
    }

    /// Whether the snapshot directory carries `.in-progress`
    pub fn is_in_progress(&self, id: &str) -> bool {
        markers::exists(&self.snapshot_dir(id), markers::IN_PROGRESS)
    }

    /// Whether the snapshot directory carries `.complete`
    pub fn is_complete(&self, id: &str) -> bool {
        markers::exists(&self.snapshot_dir(id), markers::COMPLETE)
    }

    /// Completed snapshots (no `.in-progress`), newest first
    pub fn completed(&self) -> Result<Vec<Snapshot>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|s| !self.is_in_progress(&s.id))
            .collect())
    }

    /// Delete a snapshot
    ///
    /// The id is resolved through [`Catalog::list`] first so unknown ids fail
    /// with [`SnapshotError::NotFound`]. A path that vanished in between is
    /// not an error.
    #[instrument(skip(self))]
    pub fn delete(&self, id: &str) -> Result<()> {
        let snapshot = self.find(id)?;
        info!(
            "Deleting snapshot {} ({})",
            id,
            utils::format_bytes(snapshot.size_bytes)
        );
        if !utils::remove_path(&snapshot.path)? {
            warn!("Snapshot path does not exist: {:?}", snapshot.path);
        }
        Ok(())
    }
}
