//! # Coldsnap - Cold snapshots of VM storage
//!
//! A snapshot engine for the persistent storage of a stopped virtual machine.
//! The storage is either a volume managed by the container runtime or a host
//! directory bind-mounted into the VM container.
//!
//! ## Overview
//!
//! Coldsnap lets you:
//! - Capture the VM disk as a compressed archive, a plain tar or a directory copy
//! - Restore a snapshot, rolling a bind-mounted destination back on failure
//! - Keep at most `snapshotMaxCount` completed snapshots
//! - Cancel a running creation or restoration, including its whole process group
//! - Pick up after a crash: stale locks, half-finished snapshots, orphaned helpers
//!
//! ## Architecture
//!
//! - **Catalog**: snapshots are plain directories under a root; the directory
//!   name `<timestamp>-<name>` is the id
//! - **Markers**: `.in-progress`, `.complete` and `.bind-active` files record
//!   the lifecycle durably
//! - **Lock**: a `.lock` file serializes creations and restorations across
//!   processes and restarts
//! - **Progress records**: the configuration document keeps the latest size
//!   and helper identifiers of each snapshot being produced
//! - **Helpers**: volume data is reached through short-lived containers;
//!   bind data through local `tar` pipelines
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use coldsnap::{EngineBuilder, JsonConfigStore, StorageDescriptor};
//! use tokio_util::sync::CancellationToken;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(JsonConfigStore::new("/home/me/.vm/config.json"));
//! let engine = EngineBuilder::new(store).build()?;
//!
//! // Repair whatever a previous run left behind
//! let report = engine.recover()?;
//! println!("Finalized after crash: {:?}", report.finalized);
//!
//! let storage = StorageDescriptor::bind("/home/me/.vm/storage");
//! let progress: coldsnap::ProgressCallback = Arc::new(|bytes: u64| println!("{} bytes written", bytes));
//! let snapshot = engine.create_snapshot(
//!     "before update",
//!     &storage,
//!     Some(progress),
//!     &CancellationToken::new(),
//!     None,
//! )?;
//!
//! for s in engine.list_snapshots()? {
//!     println!("{} {} ({} bytes)", s.id, s.name, s.size_bytes);
//! }
//!
//! engine.restore_snapshot(&snapshot.id, &storage)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! All operations return `Result<T, SnapshotError>`. Callers usually need to
//! tell apart a busy engine ([`SnapshotError::is_busy`]), an unknown id
//! ([`SnapshotError::is_not_found`]), a cancellation
//! ([`SnapshotError::is_cancelled`]) and a failing pipeline, which carries the
//! tail of its output and an out-of-space hint when detectable.
//!
//! ## Module Organization
//!
//! - [`engine`]: the [`SnapshotEngine`] and its builder
//! - [`catalog`]: listing and deleting snapshots on disk
//! - [`config`]: the configuration document and its stores
//! - [`runtime`]: the container runtime adapter
//! - [`pipeline`]: local shell pipelines
//! - [`progress`]: size samplers and heartbeats
//! - [`retention`]: retention planning and enforcement
//! - [`types`]: common types and data structures
//! - [`error`]: error types and handling

// Public API modules
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod lock;
pub mod markers;
pub mod pipeline;
pub mod progress;
pub mod recovery;
pub mod retention;
pub mod runtime;
pub mod types;
pub mod utils;

// Engine operations split by concern
mod create;
mod restore;

// Re-export main types for convenience
pub use catalog::{Artifact, Catalog};
pub use config::{ConfigHandle, ConfigStore, EngineOptions, JsonConfigStore, MemoryConfigStore, SnapshotSettings};
pub use engine::{EngineBuilder, SnapshotEngine};
pub use error::{FailureHint, Result, SnapshotError};
pub use recovery::RecoveryReport;
pub use runtime::{CliRuntime, ContainerRuntime, HelperTask};
pub use types::*;
pub use tokio_util::sync::CancellationToken;
