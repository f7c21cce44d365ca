//! Property-based tests for Coldsnap
//!
//! Uses proptest to check catalog parsing and retention against arbitrary
//! ids and snapshot sets.

use ::coldsnap::lock::LockCoordinator;
use ::coldsnap::{markers, retention, utils, Catalog};
use proptest::prelude::*;
use std::collections::{BTreeSet, HashSet};
use std::fs;
use tempfile::TempDir;

fn id_name() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_]{1,24}"
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_catalog_recovers_timestamp_and_name(ts in 0i64..=4_102_444_800_000, rest in id_name()) {
        let temp_dir = TempDir::new().unwrap();
        let id = format!("{}-{}", ts, rest);
        fs::create_dir_all(temp_dir.path().join(&id)).unwrap();

        let listed = Catalog::new(temp_dir.path()).list().unwrap();
        prop_assert_eq!(listed.len(), 1);
        prop_assert_eq!(listed[0].timestamp, ts);
        prop_assert_eq!(&listed[0].name, &rest.replace('_', " "));
        prop_assert_eq!(&listed[0].id, &id);
    }

    #[test]
    fn prop_catalog_excludes_unmatched(name in "[a-zA-Z_][a-zA-Z0-9_]{0,16}") {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join(&name)).unwrap();
        fs::create_dir_all(temp_dir.path().join(format!("{}-", 42))).unwrap();

        prop_assert!(Catalog::new(temp_dir.path()).list().unwrap().is_empty());
    }

    #[test]
    fn prop_generated_ids_parse_back(ts in 0i64..=4_102_444_800_000, name in "[ -~]{1,32}") {
        let id = utils::snapshot_id(ts, &name);
        let (parsed_ts, parsed_name) = utils::parse_snapshot_id(&id).unwrap();
        prop_assert_eq!(parsed_ts, ts);
        prop_assert_eq!(parsed_name, utils::sanitize_name(&name).replace('_', " "));
    }

    #[test]
    fn prop_enforce_keeps_newest_completed(
        stamps in prop::collection::btree_set(1i64..10_000, 0..8),
        running in prop::collection::btree_set(10_000i64..20_000, 0..3),
        max_count in 1u32..5,
    ) {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        for ts in &stamps {
            let dir = root.join(format!("{}-done", ts));
            fs::create_dir_all(&dir).unwrap();
            markers::touch(&dir, markers::COMPLETE).unwrap();
        }
        for ts in &running {
            let dir = root.join(format!("{}-running", ts));
            fs::create_dir_all(&dir).unwrap();
            markers::touch(&dir, markers::IN_PROGRESS).unwrap();
        }

        let catalog = Catalog::new(root);
        let lock = LockCoordinator::new(root);
        retention::enforce(&catalog, &lock, max_count, false, &HashSet::new()).unwrap();

        let remaining: BTreeSet<i64> = catalog
            .list()
            .unwrap()
            .into_iter()
            .filter(|s| !catalog.is_in_progress(&s.id))
            .map(|s| s.timestamp)
            .collect();
        let expected: BTreeSet<i64> = stamps.iter().rev().take(max_count as usize).copied().collect();
        prop_assert_eq!(remaining, expected);

        for ts in &running {
            let running_path = root.join(format!("{}-running", ts));
            prop_assert!(running_path.exists());
        }
    }
}
