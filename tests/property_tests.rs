//! Property-based tests for filerelay
//!
//! These tests verify invariants that must hold for all inputs:
//! - Path normalization never escapes the root and is idempotent
//! - Retention guards never allow deleting or purging too early
//! - Store transitions stay monotonic under any operation order
//!
//! Run with: cargo test --test property_tests

use proptest::prelude::*;

// ============================================================================
// RELATIVE PATH TESTS
// ============================================================================

mod relative_path_tests {
    use super::*;
    use filerelay::types::RelativePath;
    use std::path::Path;

    proptest! {
        /// Invariant: construction never panics on any string input
        #[test]
        fn never_panics(s in ".*") {
            let _ = RelativePath::new(&s);
        }

        /// Invariant: normalizing a normalized path changes nothing
        #[test]
        fn idempotent(s in "[a-zA-Z0-9_./\\\\-]{1,80}") {
            if let Ok(path) = RelativePath::new(&s) {
                let again = RelativePath::new(path.as_str()).unwrap();
                prop_assert_eq!(path, again);
            }
        }

        /// Invariant: a valid path has no empty, dot or parent segments
        #[test]
        fn segments_are_clean(s in "\\PC{1,120}") {
            if let Ok(path) = RelativePath::new(&s) {
                prop_assert!(!path.as_str().starts_with('/'));
                prop_assert!(!path.as_str().contains('\\'));
                for segment in path.segments() {
                    prop_assert!(!segment.is_empty());
                    prop_assert!(segment != "." && segment != "..");
                }
            }
        }

        /// Invariant: any path containing a parent segment is rejected
        #[test]
        fn parent_segments_rejected(
            prefix in "[a-z]{1,8}(/[a-z]{1,8}){0,3}",
            suffix in "[a-z]{1,8}",
        ) {
            let raw = format!("{}/../{}", prefix, suffix);
            prop_assert!(RelativePath::new(&raw).is_err());
        }

        /// Invariant: resolving under a root stays under that root
        #[test]
        fn stays_under_root(s in "[a-z0-9./]{1,60}") {
            if let Ok(path) = RelativePath::new(&s) {
                let root = Path::new("/srv/staging");
                let resolved = path.under(root);
                prop_assert!(resolved.starts_with(root));
                prop_assert_eq!(resolved.components().count(), 3 + path.depth());
            }
        }
    }
}

// ============================================================================
// ALLOW-LIST TESTS
// ============================================================================

mod allow_list_tests {
    use super::*;
    use filerelay::sync::AllowList;

    proptest! {
        /// Invariant: a parsed list contains exactly the listed values
        #[test]
        fn parse_contains_listed(values in prop::collection::vec(0u32..60, 1..10)) {
            let text = values.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(",");
            let list: AllowList = text.parse().unwrap();
            for minute in 0..60 {
                prop_assert_eq!(list.contains(minute), values.contains(&minute));
            }
        }

        /// Invariant: display output parses back to the same list
        #[test]
        fn display_round_trips(values in prop::collection::vec(0u32..24, 0..6)) {
            let list = AllowList::new(values);
            let parsed: AllowList = list.to_string().parse().unwrap();
            prop_assert_eq!(list, parsed);
        }
    }
}

// ============================================================================
// RETENTION GUARD TESTS
// ============================================================================

mod retention_tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use filerelay::sync::{may_purge, may_remove_staged};
    use filerelay::types::{RelativePath, TrackedFile};

    fn tracked(forward: Option<i64>, delete: Option<i64>) -> TrackedFile {
        let at = |ts: i64| Utc.timestamp_opt(ts, 0).unwrap();
        TrackedFile {
            relative_path: RelativePath::new("a.txt").unwrap(),
            download_time: at(1_700_000_000),
            forward_time: forward.map(at),
            delete_time: delete.map(at),
        }
    }

    proptest! {
        /// Invariant: an unforwarded file is never removed from staging
        #[test]
        fn unforwarded_never_removed(delete in proptest::option::of(1i64..2_000_000_000)) {
            prop_assert!(!may_remove_staged(&tracked(None, delete)));
        }

        /// Invariant: purge requires forward, delete and absence from staging
        #[test]
        fn purge_requires_all_three(
            forward in proptest::option::of(1i64..2_000_000_000),
            delete in proptest::option::of(1i64..2_000_000_000),
            present in any::<bool>(),
        ) {
            let allowed = may_purge(&tracked(forward, delete), present);
            prop_assert_eq!(allowed, forward.is_some() && delete.is_some() && !present);
        }

        /// Invariant: a file allowed to be removed is never yet purgeable
        #[test]
        fn remove_and_purge_exclusive(
            forward in proptest::option::of(1i64..2_000_000_000),
            delete in proptest::option::of(1i64..2_000_000_000),
        ) {
            let file = tracked(forward, delete);
            prop_assert!(!(may_remove_staged(&file) && may_purge(&file, false)));
        }
    }
}

// ============================================================================
// TRACKING STORE TESTS
// ============================================================================

mod store_tests {
    use super::*;
    use filerelay::storage::TrackingStore;
    use filerelay::types::RelativePath;

    #[derive(Debug, Clone)]
    enum Op {
        Download(usize),
        Forward(usize),
        Delete(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..4).prop_map(Op::Download),
            (0usize..4).prop_map(Op::Forward),
            (0usize..4).prop_map(Op::Delete),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Invariant: delete time implies forward time after any sequence of
        /// operations, and records exist only for downloaded paths
        #[test]
        fn lifecycle_stays_monotonic(ops in prop::collection::vec(op(), 0..40)) {
            let store = TrackingStore::open_in_memory().unwrap();
            let paths: Vec<RelativePath> = (0..4)
                .map(|i| RelativePath::new(format!("dir/file{}.txt", i)).unwrap())
                .collect();
            let mut downloaded = [false; 4];

            for op in ops {
                match op {
                    Op::Download(i) => {
                        store.record_download(&paths[i]).unwrap();
                        downloaded[i] = true;
                    }
                    Op::Forward(i) => {
                        store.mark_forwarded(&paths[i]).unwrap();
                    }
                    Op::Delete(i) => {
                        store.mark_deleted(&paths[i]).unwrap();
                    }
                }

                for (i, path) in paths.iter().enumerate() {
                    match store.get(path).unwrap() {
                        Some(file) => {
                            prop_assert!(downloaded[i]);
                            if file.delete_time.is_some() {
                                prop_assert!(file.forward_time.is_some());
                            }
                        }
                        None => prop_assert!(!downloaded[i]),
                    }
                }
            }

            let mut all = store.all_paths().unwrap();
            all.dedup();
            prop_assert_eq!(all.len(), downloaded.iter().filter(|d| **d).count());
        }
    }
}
