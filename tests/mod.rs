//! Main test module for Coldsnap
//!
//! This module includes all test suites:
//! - Integration tests for creation, restoration and retention
//! - Chaos tests for cancellation and crash recovery
//! - Property-based tests for catalog parsing and retention

pub mod support;
pub mod chaos;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use crate::support::*;
    use ::coldsnap::*;
    use std::fs;

    #[test]
    fn test_empty_root_lists_nothing() {
        let h = Harness::new();
        assert!(h.engine.list_snapshots().unwrap().is_empty());
        assert!(!h.engine.is_busy());
        assert_eq!(h.engine.busy_reason(), None);
    }

    #[test]
    fn test_unconfigured_root_is_a_config_error() {
        let store = std::sync::Arc::new(MemoryConfigStore::default());
        let engine = EngineBuilder::new(store).runtime(FakeRuntime::new()).build().unwrap();
        let err = engine
            .create_snapshot(
                "x",
                &StorageDescriptor::volume("v"),
                None,
                &CancellationToken::new(),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, SnapshotError::Config(_)), "got {:?}", err);
    }

    #[test]
    fn test_blank_name_rejected() {
        let h = Harness::new();
        let err = h
            .engine
            .create_snapshot("  ", &StorageDescriptor::volume("v"), None, &CancellationToken::new(), None)
            .unwrap_err();
        assert!(matches!(err, SnapshotError::InvalidName(_)));
        assert!(!h.engine.is_busy());
    }

    #[test]
    fn test_malformed_id_hint_rejected() {
        let h = Harness::new();
        let err = h
            .engine
            .create_snapshot(
                "x",
                &StorageDescriptor::volume("v"),
                None,
                &CancellationToken::new(),
                Some("not-an-id"),
            )
            .unwrap_err();
        assert!(matches!(err, SnapshotError::InvalidName(_)));
    }

    #[test]
    fn test_duplicate_id_rejected_without_touching_existing() {
        let h = Harness::new();
        h.runtime.set_volume("vm-data", b"v1");
        h.snapshot_volume("1000-first");

        let err = h
            .engine
            .create_snapshot(
                "first",
                &StorageDescriptor::volume("vm-data"),
                None,
                &CancellationToken::new(),
                Some("1000-first"),
            )
            .unwrap_err();
        assert!(matches!(err, SnapshotError::InvalidName(_)));
        assert_eq!(fs::read(h.root.join("1000-first/data.tar.gz")).unwrap(), b"v1");
        assert!(!h.engine.is_busy());
    }

    #[test]
    fn test_unmatched_entries_and_backups_are_ignored() {
        let h = Harness::new();
        h.plant("1000-real", b"x", &[markers::COMPLETE]);
        fs::create_dir_all(h.root.join("backup-2000")).unwrap();
        fs::create_dir_all(h.root.join("scratch")).unwrap();
        fs::write(h.root.join("3000-file_form.tar.gz"), b"gz").unwrap();

        let listed = h.engine.list_snapshots().unwrap();
        let ids: Vec<_> = listed.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["3000-file_form", "1000-real"]);
        assert_eq!(listed[0].name, "file form");
        assert!(listed[0].compressed);
    }

    #[test]
    fn test_missing_bind_source_fails_cleanly() {
        let h = Harness::new();
        let err = h
            .engine
            .create_snapshot(
                "nothing",
                &StorageDescriptor::bind(h.path("does-not-exist")),
                None,
                &CancellationToken::new(),
                Some("1000-nothing"),
            )
            .unwrap_err();
        assert!(matches!(err, SnapshotError::Filesystem { .. }), "got {:?}", err);
        assert!(!h.root.join("1000-nothing").exists());
        assert!(h.settings().snapshots_in_progress.is_empty());
        assert!(!h.engine.is_busy());
    }
}
