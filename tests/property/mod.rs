//! Property-based testing for strata
//!
//! Uses proptest to check the layer algebra on random manifests and the
//! lineage invariants across random histories of edits, restores and prunes.

use ::strata::resolver::{apply_layer, layer_between};
use ::strata::snapshot::{fold_layers, into_root_layer};
use ::strata::*;
use chrono::DateTime;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// One step of a random history
#[derive(Debug, Clone)]
pub enum HistoryStep {
    Write { path: PathBuf, content: Vec<u8> },
    Delete { index: usize },
    Snapshot,
    Restore { index: usize },
}

fn path_strategy() -> impl Strategy<Value = PathBuf> {
    (prop::collection::vec("[a-c]{1,2}", 0..=2), "[a-e]{1,3}\\.(txt|bin)").prop_map(|(dirs, file)| {
        let mut path = PathBuf::new();
        for dir in dirs {
            path.push(dir);
        }
        path.push(file);
        path
    })
}

fn content_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        // Small set of shared contents so deduplication is exercised
        (0u8..4).prop_map(|n| vec![n; 32]),
        prop::collection::vec(any::<u8>(), 0..512),
    ]
}

fn step_strategy() -> impl Strategy<Value = HistoryStep> {
    prop_oneof![
        4 => (path_strategy(), content_strategy()).prop_map(|(path, content)| HistoryStep::Write { path, content }),
        2 => any::<usize>().prop_map(|index| HistoryStep::Delete { index }),
        2 => Just(HistoryStep::Snapshot),
        1 => any::<usize>().prop_map(|index| HistoryStep::Restore { index }),
    ]
}

fn entry(hash: u8, size: u64) -> FileEntry {
    FileEntry {
        kind: EntryKind::File,
        content_hash: format!("{:064x}", hash),
        size,
        modified: DateTime::from_timestamp(1_700_000_000 + hash as i64, 0).unwrap(),
        permissions: 0o644,
    }
}

fn manifest_strategy() -> impl Strategy<Value = Manifest> {
    prop::collection::btree_map("[a-f]{1,2}".prop_map(PathBuf::from), (0u8..6, 0u64..100), 0..8)
        .prop_map(|m| m.into_iter().map(|(p, (h, s))| (p, entry(h, s))).collect())
}

/// Files under `root`, relative path to content
fn disk_state(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| (e.path().strip_prefix(root).unwrap().to_path_buf(), fs::read(e.path()).unwrap()))
        .collect()
}

/// Snapshot id and the files it captured
type Captured = Vec<(String, BTreeMap<PathBuf, Vec<u8>>)>;

/// Replays a history, returning the snapshots and the state captured by each
fn replay(steps: &[HistoryStep]) -> (TempDir, PathBuf, Strata, Captured) {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("world");
    fs::create_dir_all(&root).unwrap();
    let strata = StrataBuilder::new()
        .scope("world", &root)
        .parallel_workers(2)
        .build(temp.path().join(".strata"))
        .unwrap();

    let mut snapshots: Captured = Vec::new();
    let take = |strata: &Strata, snapshots: &mut Captured| {
        let id = strata.snapshot("step").unwrap().id;
        snapshots.push((id, disk_state(&root)));
    };
    take(&strata, &mut snapshots);

    for step in steps {
        match step {
            HistoryStep::Write { path, content } => {
                let full = root.join(path);
                // A path may collide with an existing file or directory
                if fs::create_dir_all(full.parent().unwrap()).is_ok() && !full.is_dir() {
                    let _ = fs::write(&full, content);
                }
            }
            HistoryStep::Delete { index } => {
                let files: Vec<PathBuf> = disk_state(&root).into_keys().collect();
                if !files.is_empty() {
                    fs::remove_file(root.join(&files[index % files.len()])).unwrap();
                }
            }
            HistoryStep::Snapshot => take(&strata, &mut snapshots),
            HistoryStep::Restore { index } => {
                let id = snapshots[index % snapshots.len()].0.clone();
                strata.restore(&id).unwrap();
            }
        }
    }
    (temp, root, strata, snapshots)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_layer_between_reproduces_live(parent in manifest_strategy(), live in manifest_strategy(), full in any::<bool>()) {
        let layer = layer_between(&parent, &live, full);
        let mut resolved = parent.clone();
        apply_layer(&mut resolved, &layer);
        prop_assert_eq!(&resolved, &live);

        if full {
            // A full layer is a resolution base on its own
            let mut from_scratch = Manifest::new();
            apply_layer(&mut from_scratch, &layer);
            prop_assert_eq!(&from_scratch, &live);
        }
    }

    #[test]
    fn prop_fold_matches_sequential_application(
        base in manifest_strategy(),
        middle in manifest_strategy(),
        top in manifest_strategy(),
        lower_full in any::<bool>(),
        upper_full in any::<bool>(),
    ) {
        let lower = layer_between(&base, &middle, lower_full);
        let upper = layer_between(&middle, &top, upper_full);
        let folded = fold_layers(&lower, &upper);

        let mut staged = base.clone();
        apply_layer(&mut staged, &folded);
        prop_assert_eq!(&staged, &top);

        let mut promoted = Manifest::new();
        apply_layer(&mut promoted, &into_root_layer(folded));
        if lower_full || upper_full {
            prop_assert_eq!(&promoted, &top);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn prop_every_snapshot_restores_exactly(steps in prop::collection::vec(step_strategy(), 1..30)) {
        let (_temp, root, strata, snapshots) = replay(&steps);
        for (id, expected) in snapshots.iter().rev() {
            strata.restore(id).unwrap();
            prop_assert_eq!(&disk_state(&root), expected);
        }
    }

    #[test]
    fn prop_refcounts_match_layer_entries(steps in prop::collection::vec(step_strategy(), 1..30), victim in any::<usize>()) {
        let (_temp, _root, strata, snapshots) = replay(&steps);
        let plan = strata.gc_analyze().unwrap();
        prop_assert!(plan.refcount_drift.is_empty());
        prop_assert!(plan.candidates.is_empty());

        let target = &snapshots[victim % snapshots.len()].0;
        strata.prune(target, PrunePolicy::Cascade).unwrap();
        let plan = strata.gc_analyze().unwrap();
        prop_assert!(plan.refcount_drift.is_empty());
        prop_assert!(plan.missing_blocks.is_empty());
    }

    #[test]
    fn prop_reparent_prune_preserves_resolution(steps in prop::collection::vec(step_strategy(), 1..30), victim in any::<usize>()) {
        let (_temp, root, strata, snapshots) = replay(&steps);
        let lineage = strata.lineage();
        let (target, _) = &snapshots[victim % snapshots.len()];
        let is_root_with_siblings = lineage.require(target).unwrap().is_root() && lineage.children(target).len() > 1;
        prop_assume!(!is_root_with_siblings);

        let before: BTreeMap<String, Manifest> = snapshots
            .iter()
            .filter(|(id, _)| id != target)
            .map(|(id, _)| (id.clone(), strata.resolve(id, "world").unwrap()))
            .collect();

        strata.prune(target, PrunePolicy::Reparent).unwrap();
        strata.gc().unwrap();
        prop_assert_eq!(strata.list_snapshots().len(), snapshots.len() - 1);

        for (id, expected) in &before {
            prop_assert_eq!(&strata.resolve(id, "world").unwrap(), expected);
        }
        for (id, state) in snapshots.iter().filter(|(id, _)| id != target) {
            strata.restore(id).unwrap();
            prop_assert_eq!(&disk_state(&root), state);
        }
        prop_assert!(strata.verify_all().unwrap().is_valid());
    }
}
