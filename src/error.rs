//! Error types for the coldsnap engine
//!
//! Every fallible operation returns [`Result<T>`] with a [`SnapshotError`].
//! The variants follow the failure classes a caller has to tell apart: the
//! engine being busy, an unknown snapshot id, a failing archive/extract
//! pipeline, a caller-initiated cancellation, and filesystem failures while
//! moving or marking snapshot data.

use crate::types::LockReason;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Type alias for Results in the coldsnap library
pub type Result<T> = std::result::Result<T, SnapshotError>;

/// Diagnosis extracted from a failing pipeline's output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureHint {
    /// The destination ran out of space (or quota)
    InsufficientSpace,
}

impl fmt::Display for FailureHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureHint::InsufficientSpace => write!(f, "insufficient disk space"),
        }
    }
}

/// Main error type for all snapshot operations
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// Another creation or restoration currently holds the lock
    #[error("Snapshot engine is busy: a {reason} operation is already running")]
    Busy {
        /// Reason recorded by the current lock holder
        reason: LockReason,
    },

    /// Snapshot id is not present in the catalog
    #[error("Snapshot not found: {0}")]
    NotFound(String),

    /// An archiving or extraction process exited unsuccessfully
    #[error("{stage} failed (exit code {}){}", format_code(.code), format_hint(.hint))]
    Pipeline {
        /// Pipeline stage label, e.g. `restore.bind.extract`
        stage: String,
        /// Exit code, if the process exited normally
        code: Option<i32>,
        /// Last lines of the pipeline's diagnostic output
        tail: String,
        /// Classified failure cause, when detectable
        hint: Option<FailureHint>,
    },

    /// The operation was aborted by the caller
    #[error("Snapshot operation cancelled: {0}")]
    Cancelled(String),

    /// Filesystem failure with the operation and path that caused it
    #[error("Filesystem error during {operation} on {path:?}: {source}")]
    Filesystem {
        /// What was being attempted (`rename`, `copy`, `write marker`, ...)
        operation: &'static str,
        /// Path involved
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// I/O errors without further context
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// Container runtime command failed
    #[error("Container runtime error: {0}")]
    Runtime(String),

    /// Configuration document is missing or invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// Snapshot name or id cannot be used
    #[error("Invalid snapshot name: {0:?}")]
    InvalidName(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

fn format_code(code: &Option<i32>) -> String {
    match code {
        Some(c) => c.to_string(),
        None => "signal".to_string(),
    }
}

fn format_hint(hint: &Option<FailureHint>) -> String {
    match hint {
        Some(h) => format!(": {}", h),
        None => String::new(),
    }
}

impl SnapshotError {
    /// Create a container runtime error with a custom message
    pub fn runtime(msg: impl Into<String>) -> Self {
        SnapshotError::Runtime(msg.into())
    }

    /// Create a configuration error with a custom message
    pub fn config(msg: impl Into<String>) -> Self {
        SnapshotError::Config(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        SnapshotError::Internal(msg.into())
    }

    /// Wrap an I/O error with the operation and path that produced it
    pub fn filesystem(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SnapshotError::Filesystem {
            operation,
            path: path.into(),
            source,
        }
    }

    /// Check if this error means another operation holds the lock
    pub fn is_busy(&self) -> bool {
        matches!(self, SnapshotError::Busy { .. })
    }

    /// Check if this error was caused by cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SnapshotError::Cancelled(_))
    }

    /// Check if this error is an unknown snapshot id
    pub fn is_not_found(&self) -> bool {
        matches!(self, SnapshotError::NotFound(_))
    }

    /// Diagnostic tail for pipeline failures
    pub fn diagnostic_tail(&self) -> Option<&str> {
        match self {
            SnapshotError::Pipeline { tail, .. } => Some(tail.as_str()),
            _ => None,
        }
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            SnapshotError::Busy { reason } => {
                format!("A {} operation is already running. Wait for it to finish or cancel it first.", reason)
            }
            SnapshotError::NotFound(id) => {
                format!("Snapshot '{}' not found. Use 'list' to see available snapshots.", id)
            }
            SnapshotError::Pipeline { hint: Some(FailureHint::InsufficientSpace), stage, .. } => {
                format!("{} ran out of disk space. Free some space or lower the snapshot limit.", stage)
            }
            _ => self.to_string(),
        }
    }
}

/// Attach filesystem context to `io::Result` values
pub(crate) trait FsContext<T> {
    /// Convert an I/O failure into [`SnapshotError::Filesystem`]
    fn fs_context(self, operation: &'static str, path: &Path) -> Result<T>;
}

impl<T> FsContext<T> for std::io::Result<T> {
    fn fs_context(self, operation: &'static str, path: &Path) -> Result<T> {
        self.map_err(|e| SnapshotError::filesystem(operation, path, e))
    }
}
