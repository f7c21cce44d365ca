//! Utility functions for the snapshot engine
//!
//! ## Categories of Utilities
//!
//! ### Naming
//! - Sanitizing user-supplied snapshot names into id-safe strings
//! - Parsing `<timestamp>-<name>` ids back into their parts
//!
//! ### File Operations
//! - Recursive sizing and newest-modification lookup
//! - Recursive copy that preserves symlinks and permissions
//! - Directory moves that fall back to copy + delete across filesystems
//! - Atomic file writing
//!
//! ### Processes
//! - Liveness probing of a pid without signalling it
//!
//! All functions return `Result<T, SnapshotError>`; filesystem failures carry
//! the operation and path that failed.

use crate::error::{FsContext, Result};
use regex::Regex;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::SystemTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use walkdir::WalkDir;

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Replace every character outside `[A-Za-z0-9]` with `_`
///
/// ```rust
/// use coldsnap::utils::sanitize_name;
///
/// assert_eq!(sanitize_name("before update!"), "before_update_");
/// ```
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Build the canonical id `<timestamp>-<sanitized name>`
pub fn snapshot_id(timestamp: i64, name: &str) -> String {
    format!("{}-{}", timestamp, sanitize_name(name))
}

fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(\d+)-(.+)$").expect("static id pattern is valid"))
}

/// Split an id into `(timestamp, name)`
///
/// Underscores in the name part map back to spaces. Returns `None` for ids
/// that do not look like `<digits>-<rest>` or whose timestamp overflows.
///
/// ```rust
/// use coldsnap::utils::parse_snapshot_id;
///
/// assert_eq!(
///     parse_snapshot_id("1700000000000-before_update"),
///     Some((1_700_000_000_000, "before update".to_string()))
/// );
/// assert_eq!(parse_snapshot_id("backup-1700000000000"), None);
/// ```
pub fn parse_snapshot_id(id: &str) -> Option<(i64, String)> {
    let caps = id_pattern().captures(id)?;
    let timestamp = caps.get(1)?.as_str().parse::<i64>().ok()?;
    let name = caps.get(2)?.as_str().replace('_', " ");
    Some((timestamp, name))
}

/// Size of a file, or the recursive sum of file sizes under a directory
///
/// Missing paths report `0`. Entries that vanish mid-walk are skipped, so
/// this is safe to call against a tree that is still being written.
pub fn path_size(path: &Path) -> u64 {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_file() => meta.len(),
        Ok(meta) if meta.is_dir() => WalkDir::new(path)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum(),
        _ => 0,
    }
}

/// Most recent modification time of a file or of anything inside a directory
pub fn newest_mtime(path: &Path) -> Option<SystemTime> {
    let meta = fs::symlink_metadata(path).ok()?;
    if !meta.is_dir() {
        return meta.modified().ok();
    }
    WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter_map(|e| e.metadata().ok())
        .filter_map(|m| m.modified().ok())
        .max()
}

/// Recursively copy `src` into `dest`, file by file
///
/// `skip` receives paths relative to `src`; matching entries (and, for
/// directories, everything below them) are left out. Symlinks are recreated
/// rather than followed. Returns the number of files copied.
///
/// # Errors
///
/// - [`SnapshotError::Cancelled`](crate::SnapshotError::Cancelled) when `cancel` fires mid-copy
/// - [`SnapshotError::Filesystem`](crate::SnapshotError::Filesystem) for copy failures
pub fn copy_tree(
    src: &Path,
    dest: &Path,
    skip: &dyn Fn(&Path) -> bool,
    cancel: Option<&CancellationToken>,
) -> Result<u64> {
    info!("Starting recursive copy from {:?} to {:?}", src, dest);
    fs::create_dir_all(dest).fs_context("create directory", dest)?;

    let mut files = 0u64;
    let mut walker = WalkDir::new(src).min_depth(1).into_iter();
    while let Some(entry) = walker.next() {
        if cancel.is_some_and(|c| c.is_cancelled()) {
            return Err(crate::SnapshotError::Cancelled(format!("copy of {:?}", src)));
        }

        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| crate::SnapshotError::internal(e.to_string()))?;
        if skip(rel) {
            if entry.file_type().is_dir() {
                walker.skip_current_dir();
            }
            continue;
        }

        let target = dest.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target).fs_context("create directory", &target)?;
            let perms = entry.metadata()?.permissions();
            fs::set_permissions(&target, perms).fs_context("set permissions", &target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path()).fs_context("read link", entry.path())?;
            create_symlink(&link, &target)?;
        } else {
            fs::copy(entry.path(), &target).fs_context("copy", &target)?;
            files += 1;
            if files % 100 == 0 {
                info!("Copied {} files so far...", files);
            }
        }
    }

    info!("Finished copying {} total files", files);
    Ok(files)
}

/// Move a directory, copying then deleting when a rename crosses filesystems
pub fn move_dir(src: &Path, dest: &Path) -> Result<()> {
    match fs::rename(src, dest) {
        Ok(()) => {
            trace!("Renamed {:?} -> {:?}", src, dest);
            Ok(())
        }
        Err(e) if is_cross_device(&e) => {
            debug!("Rename {:?} -> {:?} crosses filesystems, copying instead", src, dest);
            copy_tree(src, dest, &|_| false, None)?;
            fs::remove_dir_all(src).fs_context("remove directory", src)?;
            Ok(())
        }
        Err(e) => Err(crate::SnapshotError::filesystem("rename", src, e)),
    }
}

fn is_cross_device(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(nix::errno::Errno::EXDEV as i32)
}

/// Remove a file or directory tree; absent paths are not an error
///
/// Returns `true` if something was removed.
pub fn remove_path(path: &Path) -> Result<bool> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(crate::SnapshotError::filesystem("stat", path, e)),
    };
    let res = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match res {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(crate::SnapshotError::filesystem("remove", path, e)),
    }
}

/// Atomic file write (write to temp file in the same directory, then rename)
///
/// Readers either see the previous content or the complete new content,
/// never a partially written file.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).fs_context("create temp file", dir)?;
    tmp.write_all(content).fs_context("write", tmp.path())?;
    tmp.as_file().sync_all().fs_context("sync", tmp.path())?;
    tmp.persist(path)
        .map_err(|e| crate::SnapshotError::filesystem("persist", path, e.error))?;
    Ok(())
}

/// Whether a process with this pid currently exists
///
/// Uses a null signal, which checks for existence without delivering
/// anything. A permission error still means the process exists.
pub fn is_pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Format bytes into human-readable string
///
/// Uses binary units (1024-based).
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Create a symlink
#[cfg(unix)]
pub fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link).fs_context("symlink", link)?;
    Ok(())
}

/// Absolute form of `path` without requiring it to exist
pub fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
