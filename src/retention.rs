//! Retention enforcement
//!
//! Keeps the number of completed snapshots at or below `snapshotMaxCount`
//! by deleting the oldest completed ones. In-progress snapshots are never
//! deleted; in "reserve slot" mode they count against the limit so that
//! space is freed before a new snapshot starts writing.

use crate::catalog::Catalog;
use crate::error::Result;
use crate::lock::LockCoordinator;
use crate::types::{LockReason, Snapshot};
use std::collections::HashSet;
use tracing::{debug, info, instrument, warn};

/// Select the snapshots to delete
///
/// `entries` pairs each snapshot with its in-progress flag, in any order.
/// Returns the victims oldest first. A `max_count` of `0` means unlimited.
pub fn plan(
    entries: &[(Snapshot, bool)],
    max_count: u32,
    reserve_in_progress: bool,
    exclude: &HashSet<String>,
) -> Vec<Snapshot> {
    if max_count == 0 {
        return Vec::new();
    }

    let counted: Vec<&(Snapshot, bool)> = entries.iter().filter(|(s, _)| !exclude.contains(&s.id)).collect();
    let mut completed: Vec<&Snapshot> = counted.iter().filter(|(_, ip)| !ip).map(|(s, _)| s).collect();
    let in_progress = counted.iter().filter(|(_, ip)| *ip).count();

    let taken = completed.len() + if reserve_in_progress { in_progress } else { 0 };
    let max = max_count as usize;
    if taken <= max {
        return Vec::new();
    }

    completed.sort_by_key(|s| s.timestamp);
    completed
        .into_iter()
        .take(taken - max)
        .cloned()
        .collect()
}

fn entries(catalog: &Catalog) -> Result<Vec<(Snapshot, bool)>> {
    Ok(catalog
        .list()?
        .into_iter()
        .map(|s| {
            let in_progress = catalog.is_in_progress(&s.id);
            (s, in_progress)
        })
        .collect())
}

/// Delete the oldest completed snapshots beyond `max_count`
///
/// Does nothing while a restoration holds the lock. Returns the deleted ids.
#[instrument(skip(catalog, lock, exclude), fields(stage = "retention"))]
pub fn enforce(
    catalog: &Catalog,
    lock: &LockCoordinator,
    max_count: u32,
    reserve_in_progress: bool,
    exclude: &HashSet<String>,
) -> Result<Vec<String>> {
    if lock.reason() == Some(LockReason::Restore) {
        debug!("Restore in progress, skipping retention");
        return Ok(Vec::new());
    }

    let victims = plan(&entries(catalog)?, max_count, reserve_in_progress, exclude);
    let mut deleted = Vec::with_capacity(victims.len());
    for victim in victims {
        info!("Retention limit {} exceeded, deleting {}", max_count, victim.id);
        match catalog.delete(&victim.id) {
            Ok(()) => deleted.push(victim.id),
            Err(e) if e.is_not_found() => debug!("{} already gone", victim.id),
            Err(e) => {
                warn!("Failed to delete {}: {}", victim.id, e);
                return Err(e);
            }
        }
    }
    Ok(deleted)
}

/// Completed snapshots a new creation would delete, oldest first
pub fn preview(catalog: &Catalog, max_count: u32) -> Result<Vec<Snapshot>> {
    if max_count == 0 {
        return Ok(Vec::new());
    }
    let entries = entries(catalog)?;
    let completed = entries.iter().filter(|(_, ip)| !ip).count();
    let in_progress = entries.len() - completed;
    let taken = completed + in_progress + 1;
    let max = max_count as usize;
    if taken <= max {
        return Ok(Vec::new());
    }

    let mut victims: Vec<Snapshot> = entries.into_iter().filter(|(_, ip)| !ip).map(|(s, _)| s).collect();
    victims.sort_by_key(|s| s.timestamp);
    victims.truncate(taken - max);
    Ok(victims)
}
