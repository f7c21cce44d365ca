//! Chaos tests for Coldsnap
//!
//! Tests resilience against cancellation mid-flight, overlapping operations,
//! processes that died holding the lock, and snapshots orphaned by a crash.

use crate::support::*;
use ::coldsnap::lock::LockCoordinator;
use ::coldsnap::pipeline::ShellPipeline;
use ::coldsnap::*;
use filetime::FileTime;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

const SETTLE: Duration = Duration::from_secs(5);

fn age(path: &std::path::Path, by: Duration) {
    let then = FileTime::from_system_time(SystemTime::now() - by);
    filetime::set_file_mtime(path, then).unwrap();
}

fn write_lock(h: &Harness, record: &LockRecord) {
    fs::create_dir_all(&h.root).unwrap();
    fs::write(h.root.join(".lock"), serde_json::to_vec(record).unwrap()).unwrap();
}

#[test]
fn test_restore_during_create_is_busy_and_cancel_cleans_up() {
    let h = Harness::new();
    h.runtime.set_mode(HelperMode::Hang);
    let vm = h.path("vm");
    populate(&vm, &[("disk.img", b"untouched")]);
    let before = snapshot_tree(&vm);

    std::thread::scope(|s| {
        let worker = s.spawn(|| {
            h.engine.create_snapshot(
                "long",
                &StorageDescriptor::volume("vm-data"),
                None,
                &CancellationToken::new(),
                Some("1000-long"),
            )
        });

        assert!(wait_until(SETTLE, || h.runtime.running_count() == 1));
        assert_eq!(h.engine.busy_reason(), Some(LockReason::Snapshot));

        let err = h
            .engine
            .restore_snapshot("1000-long", &StorageDescriptor::bind(&vm))
            .unwrap_err();
        assert!(matches!(err, SnapshotError::Busy { reason: LockReason::Snapshot }), "got {:?}", err);
        assert_eq!(snapshot_tree(&vm), before);
        assert!(h.engine.delete_snapshot("1000-long").unwrap_err().is_busy());

        assert!(h.engine.cancel_current(None).unwrap());
        let err = worker.join().unwrap().unwrap_err();
        assert!(matches!(&err, SnapshotError::Cancelled(id) if id == "1000-long"));
    });

    assert!(!h.root.join("1000-long").exists());
    assert!(h.settings().snapshots_in_progress.is_empty());
    assert!(!h.engine.is_busy());
    assert_eq!(h.engine.current_operation(), None);
    assert_eq!(h.runtime.running_count(), 0);
    assert!(h.runtime.removed().contains(&"fake-1".to_string()));
}

#[test]
fn test_second_create_is_busy() {
    let h = Harness::new();
    h.runtime.set_mode(HelperMode::Hang);

    std::thread::scope(|s| {
        let worker = s.spawn(|| {
            h.engine.create_snapshot(
                "first",
                &StorageDescriptor::volume("vm-data"),
                None,
                &CancellationToken::new(),
                Some("1000-first"),
            )
        });
        assert!(wait_until(SETTLE, || h.runtime.running_count() == 1));

        let err = h
            .engine
            .create_snapshot(
                "second",
                &StorageDescriptor::volume("vm-data"),
                None,
                &CancellationToken::new(),
                Some("2000-second"),
            )
            .unwrap_err();
        assert!(err.is_busy());
        assert!(!h.root.join("2000-second").exists());

        h.engine.cancel_current(Some("1000-first")).unwrap();
        assert!(worker.join().unwrap().unwrap_err().is_cancelled());
    });
}

#[test]
fn test_caller_token_cancels_bind_pipeline() {
    let h = Harness::new();
    let vm = h.path("vm");
    populate(&vm, &[("disk.img", b"data")]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = h
        .engine
        .create_snapshot("bind", &StorageDescriptor::bind(&vm), None, &cancel, Some("1000-bind"))
        .unwrap_err();
    assert!(err.is_cancelled(), "got {:?}", err);
    assert!(!h.root.join("1000-bind").exists());
    assert!(h.settings().snapshots_in_progress.is_empty());
    assert!(!h.engine.is_busy());
}

#[test]
fn test_caller_token_cancels_bind_copy() {
    let h = Harness::with_settings(|s| s.snapshot_compression = false);
    let vm = h.path("vm");
    populate(&vm, &[("a", b"1"), ("b", b"2")]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = h
        .engine
        .create_snapshot("copy", &StorageDescriptor::bind(&vm), None, &cancel, Some("1000-copy"))
        .unwrap_err();
    assert!(err.is_cancelled());
    assert!(!h.root.join("1000-copy").exists());
    assert!(!h.engine.is_busy());
}

#[test]
fn test_quick_finalize_after_crash() {
    let h = Harness::new();
    let old = h.plant("1000-old", b"finished archive", &[markers::IN_PROGRESS, markers::COMPLETE]);
    age(&old.join("data.tar.gz"), Duration::from_secs(120));
    let fresh = h.plant("2000-fresh", b"settling", &[markers::IN_PROGRESS, markers::COMPLETE]);
    for id in ["1000-old", "2000-fresh"] {
        h.engine
            .config()
            .put_record(id, SnapshotInProgress::default())
            .unwrap();
    }

    let report = h.engine.recover().unwrap();
    assert_eq!(report.finalized, vec!["1000-old"]);
    assert!(!markers::exists(&old, markers::IN_PROGRESS));
    assert!(!markers::exists(&old, markers::COMPLETE));
    assert!(markers::exists(&fresh, markers::IN_PROGRESS));

    let records = h.settings().snapshots_in_progress;
    assert!(!records.contains_key("1000-old"));
    assert!(records.contains_key("2000-fresh"));

    let listed = h.engine.list_snapshots().unwrap();
    let old_entry = listed.iter().find(|s| s.id == "1000-old").unwrap();
    assert_eq!(old_entry.size_bytes, 16);
    assert!(old_entry.compressed);
}

#[test]
fn test_recover_prunes_records_without_directory() {
    let h = Harness::new();
    fs::create_dir_all(&h.root).unwrap();
    h.engine
        .config()
        .put_record("1000-vanished", SnapshotInProgress::default())
        .unwrap();

    let report = h.engine.recover().unwrap();
    assert_eq!(report.pruned, vec!["1000-vanished"]);
    assert!(h.settings().snapshots_in_progress.is_empty());
}

#[test]
fn test_stale_restore_lock_is_rolled_back() {
    let h = Harness::new();
    let vm = h.path("vm");
    let backup = h.root.join("backup-1000");
    populate(&backup, &[("disk.img", b"before restore"), ("nvram", b"efi")]);
    populate(&vm, &[("disk.img", b"half writ")]);
    write_lock(
        &h,
        &LockRecord {
            reason: LockReason::Restore,
            started_at: 1000,
            pid: Some(dead_pid()),
            destination: Some(vm.clone()),
            backup: Some(backup.clone()),
        },
    );
    assert!(h.engine.is_busy());

    let report = h.engine.recover().unwrap();
    assert_eq!(report.reclaimed_lock, Some(LockReason::Restore));
    assert_eq!(report.rolled_back.as_deref(), Some(vm.as_path()));
    assert_eq!(fs::read(vm.join("disk.img")).unwrap(), b"before restore");
    assert_eq!(fs::read(vm.join("nvram")).unwrap(), b"efi");
    assert!(!backup.exists());
    assert!(!h.engine.is_busy());
}

#[test]
fn test_stale_lock_before_move_keeps_destination() {
    let h = Harness::new();
    let vm = h.path("vm");
    populate(&vm, &[("disk.img", b"never moved")]);
    write_lock(
        &h,
        &LockRecord {
            reason: LockReason::Restore,
            started_at: 1000,
            pid: Some(dead_pid()),
            destination: Some(vm.clone()),
            backup: Some(h.root.join("backup-1000")),
        },
    );

    let report = h.engine.recover().unwrap();
    assert_eq!(report.reclaimed_lock, Some(LockReason::Restore));
    assert_eq!(report.rolled_back, None);
    assert_eq!(fs::read(vm.join("disk.img")).unwrap(), b"never moved");
    assert!(!h.engine.is_busy());
}

#[test]
fn test_live_lock_is_not_reclaimed() {
    let h = Harness::new();
    fs::create_dir_all(&h.root).unwrap();
    let lock = LockCoordinator::new(&h.root);
    let _guard = lock.try_acquire(LockReason::Snapshot).unwrap();

    let report = h.engine.recover().unwrap();
    assert_eq!(report.reclaimed_lock, None);
    assert_eq!(h.engine.busy_reason(), Some(LockReason::Snapshot));
}

#[test]
fn test_attach_finalizes_when_producer_is_gone() {
    let h = Harness::new();
    let dir = h.plant("1000-orphan", b"whole archive", &[markers::IN_PROGRESS]);
    h.engine
        .config()
        .put_record(
            "1000-orphan",
            SnapshotInProgress {
                name: "orphan".to_string(),
                timestamp: 1000,
                container_id: Some("ghost".to_string()),
                ..Default::default()
            },
        )
        .unwrap();

    let ticks = Arc::new(AtomicUsize::new(0));
    let on_tick: AttachCallback = {
        let ticks = Arc::clone(&ticks);
        Arc::new(move |id: &str, bytes: u64| {
            assert_eq!(id, "1000-orphan");
            assert_eq!(bytes, 13);
            ticks.fetch_add(1, Ordering::SeqCst);
        })
    };

    let attached = h.engine.attach_to_in_progress(on_tick).unwrap();
    assert_eq!(attached, vec!["1000-orphan"]);
    // a second call does not attach twice
    assert!(h.engine.attach_to_in_progress(Arc::new(|_: &str, _: u64| {})).unwrap().is_empty());

    assert!(wait_until(SETTLE, || !markers::exists(&dir, markers::IN_PROGRESS)));
    assert!(wait_until(SETTLE, || h.settings().snapshots_in_progress.is_empty()));
    assert!(ticks.load(Ordering::SeqCst) >= 1);
    assert_eq!(h.ids(), vec!["1000-orphan"]);
    h.engine.detach_all();
}

#[test]
fn test_attach_waits_for_complete_marker_while_helper_runs() {
    let h = Harness::new();
    h.runtime.start_orphan("live");
    let dir = h.plant("1000-running", b"growing", &[markers::IN_PROGRESS]);
    h.engine
        .config()
        .put_record(
            "1000-running",
            SnapshotInProgress {
                container_id: Some("live".to_string()),
                ..Default::default()
            },
        )
        .unwrap();

    let attached = h.engine.attach_to_in_progress(Arc::new(|_: &str, _: u64| {})).unwrap();
    assert_eq!(attached.len(), 1);

    std::thread::sleep(Duration::from_millis(200));
    assert!(markers::exists(&dir, markers::IN_PROGRESS));

    markers::touch(&dir, markers::COMPLETE).unwrap();
    assert!(wait_until(SETTLE, || !markers::exists(&dir, markers::IN_PROGRESS)));
    h.engine.detach_all();
}

#[test]
fn test_attach_skips_empty_and_discards_dead_copies() {
    let h = Harness::new();
    let empty = h.root.join("1000-empty");
    fs::create_dir_all(&empty).unwrap();
    markers::touch(&empty, markers::IN_PROGRESS).unwrap();

    let copy = h.root.join("2000-copy");
    populate(&copy, &[("disk.img", b"half")]);
    markers::touch(&copy, markers::IN_PROGRESS).unwrap();
    markers::write_bind_active(
        &copy,
        &BindActive {
            pid: dead_pid(),
            started_at: 2000,
            cmd: BindActive::COPY_CMD.to_string(),
            snapshot_id: "2000-copy".to_string(),
            artifact_path: copy.clone(),
        },
    )
    .unwrap();

    let attached = h.engine.attach_to_in_progress(Arc::new(|_: &str, _: u64| {})).unwrap();
    assert!(attached.is_empty());
    assert!(empty.exists());
    assert!(!copy.exists());
}

#[test]
fn test_cancel_orphaned_helper_container() {
    let h = Harness::new();
    h.runtime.start_orphan("live");
    let dir = h.plant("1000-orphan", b"partial", &[markers::IN_PROGRESS]);
    h.engine
        .config()
        .put_record(
            "1000-orphan",
            SnapshotInProgress {
                container_id: Some("live".to_string()),
                ..Default::default()
            },
        )
        .unwrap();

    assert!(h.engine.cancel_current(Some("1000-orphan")).unwrap());
    assert!(!dir.exists());
    assert_eq!(h.runtime.running_count(), 0);
    assert!(h.settings().snapshots_in_progress.is_empty());

    // nothing left to cancel, completed snapshots are never touched
    h.plant("2000-done", b"done", &[markers::COMPLETE]);
    assert!(!h.engine.cancel_current(Some("2000-done")).unwrap());
    assert!(h.root.join("2000-done").exists());
}

#[test]
fn test_cancel_orphaned_bind_pipeline_kills_process_group() {
    let h = Harness::new();
    let dir = h.plant("1000-orphan", b"partial", &[markers::IN_PROGRESS]);
    let running = ShellPipeline::new("test.orphan", "sleep 30 | cat").spawn().unwrap();
    let pid = running.pid();
    markers::write_bind_active(
        &dir,
        &BindActive {
            pid,
            started_at: 1000,
            cmd: "sleep 30 | cat".to_string(),
            snapshot_id: "1000-orphan".to_string(),
            artifact_path: dir.join("data.tar.gz"),
        },
    )
    .unwrap();

    assert!(h.engine.cancel_current(Some("1000-orphan")).unwrap());
    assert!(!dir.exists());

    // the killed pipeline reports failure to whoever still waits on it
    let err = running.wait(&CancellationToken::new()).unwrap_err();
    assert!(matches!(err, SnapshotError::Pipeline { .. }), "got {:?}", err);
}

#[test]
fn test_cancelled_restore_keeps_snapshot() {
    let h = Harness::new();
    h.runtime.set_volume("vm-data", b"state");
    h.snapshot_volume("1000-keep");
    h.runtime.set_mode(HelperMode::Hang);

    std::thread::scope(|s| {
        let worker = s.spawn(|| {
            h.engine
                .restore_snapshot("1000-keep", &StorageDescriptor::volume("vm-data"))
        });
        assert!(wait_until(SETTLE, || h.runtime.running_count() == 1));
        assert_eq!(h.engine.busy_reason(), Some(LockReason::Restore));
        assert_eq!(
            h.engine.current_operation(),
            Some(("1000-keep".to_string(), LockReason::Restore))
        );

        assert!(h.engine.cancel_current(Some("1000-keep")).unwrap());
        assert!(worker.join().unwrap().unwrap_err().is_cancelled());
    });

    assert_eq!(h.ids(), vec!["1000-keep"]);
    assert!(!h.engine.is_busy());
    assert_eq!(h.runtime.running_count(), 0);
}

/// No running (non-zombie) process is left in group `pgid`
fn group_gone(pgid: u32) -> bool {
    let Ok(entries) = fs::read_dir("/proc") else {
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;
        return killpg(Pid::from_raw(pgid as i32), None).is_err();
    };
    !entries.flatten().any(|entry| {
        let Ok(stat) = fs::read_to_string(entry.path().join("stat")) else {
            return false;
        };
        // fields after the command name: state ppid pgrp ...
        let Some((_, rest)) = stat.rsplit_once(')') else {
            return false;
        };
        let fields: Vec<&str> = rest.split_whitespace().collect();
        fields.len() > 2 && fields[0] != "Z" && fields[2] == pgid.to_string()
    })
}

#[test]
fn test_cancel_running_bind_pipeline_cleans_up() {
    let h = Harness::new();
    let vm = h.path("vm");
    fs::create_dir_all(&vm).unwrap();
    // sparse, so tar streams far more zeros than the disk holds
    fs::File::create(vm.join("disk.img"))
        .unwrap()
        .set_len(16 << 30)
        .unwrap();
    let dir = h.root.join("1000-slow");
    let cancel = CancellationToken::new();

    let pgid = std::thread::scope(|s| {
        let worker = s.spawn(|| {
            h.engine
                .create_snapshot("slow", &StorageDescriptor::bind(&vm), None, &cancel, Some("1000-slow"))
        });

        assert!(wait_until(SETTLE, || markers::read_bind_active(&dir).is_some()));
        let pgid = markers::read_bind_active(&dir).unwrap().pid;
        assert!(!group_gone(pgid));
        assert_eq!(h.engine.busy_reason(), Some(LockReason::Snapshot));
        assert_eq!(h.settings().snapshots_in_progress["1000-slow"].bind_pid, Some(pgid));

        cancel.cancel();
        let err = worker.join().unwrap().unwrap_err();
        assert!(err.is_cancelled(), "got {:?}", err);
        pgid
    });

    assert!(wait_until(SETTLE, || group_gone(pgid)));
    assert!(!dir.exists());
    assert!(h.settings().snapshots_in_progress.is_empty());
    assert!(!h.engine.is_busy());
    assert_eq!(h.engine.current_operation(), None);
}

fn plant_bind_pipeline(h: &Harness, id: &str, pid: u32) -> std::path::PathBuf {
    let dir = h.plant(id, b"truncated gzip", &[markers::IN_PROGRESS]);
    markers::write_bind_active(
        &dir,
        &BindActive {
            pid,
            started_at: 1000,
            cmd: "tar cvf - -C \"$1\" . | pigz > \"$2\"".to_string(),
            snapshot_id: id.to_string(),
            artifact_path: dir.join("data.tar.gz"),
        },
    )
    .unwrap();
    h.engine
        .config()
        .put_record(
            id,
            SnapshotInProgress {
                bind_pid: Some(pid),
                bind_active: Some(true),
                ..Default::default()
            },
        )
        .unwrap();
    dir
}

#[test]
fn test_attach_discards_bind_pipeline_that_died_with_its_process() {
    let h = Harness::with_settings(|s| s.snapshot_max_count = 1);
    h.plant("500-good", b"older archive", &[markers::COMPLETE]);
    let dir = plant_bind_pipeline(&h, "1000-crashed", dead_pid());

    let report = h.engine.recover().unwrap();
    assert!(report.finalized.is_empty());

    let attached = h.engine.attach_to_in_progress(Arc::new(|_: &str, _: u64| {})).unwrap();
    assert!(attached.is_empty());
    assert!(!dir.exists());
    assert!(h.settings().snapshots_in_progress.is_empty());
    // the truncated archive never displaced a good snapshot
    assert_eq!(h.ids(), vec!["500-good"]);
}

#[test]
fn test_reconciler_discards_bind_pipeline_that_dies_while_followed() {
    let h = Harness::new();
    let running = ShellPipeline::new("test.crashed", "sleep 0.3").spawn().unwrap();
    let dir = plant_bind_pipeline(&h, "1000-crashed", running.pid());

    let attached = h.engine.attach_to_in_progress(Arc::new(|_: &str, _: u64| {})).unwrap();
    assert_eq!(attached, vec!["1000-crashed"]);
    assert!(dir.exists());

    // reap it so the pid stops resolving
    running.wait(&CancellationToken::new()).unwrap();
    assert!(wait_until(SETTLE, || !dir.exists()));
    assert!(wait_until(SETTLE, || h.settings().snapshots_in_progress.is_empty()));
    assert!(h.ids().is_empty());
    h.engine.detach_all();
}
