//! Main test module for strata
//!
//! This module includes all test suites:
//! - Integration tests for multi-scope, multi-branch scenarios
//! - Chaos tests for corrupted or interrupted storage
//! - Property-based tests for lineage invariants
//! - Edge cases and stress tests

pub mod integration;
pub mod chaos;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::strata::*;
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn setup() -> (TempDir, PathBuf, Strata) {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("tree");
        fs::create_dir_all(&root).unwrap();
        let strata = StrataBuilder::new()
            .scope("tree", &root)
            .build(temp_dir.path().join(".strata"))
            .unwrap();
        (temp_dir, root, strata)
    }

    #[test]
    fn test_empty_directory() {
        let (_temp, root, strata) = setup();

        // Snapshot of an empty scope
        let snapshot = strata.snapshot("Empty").unwrap();
        assert_eq!(strata.snapshot_size(&snapshot.id).unwrap().file_count, 0);

        // Add files
        fs::create_dir_all(root.join("sub/dir")).unwrap();
        fs::write(root.join("sub/dir/file.txt"), "content").unwrap();

        // Restore removes the file and the directories it needed
        strata.restore(&snapshot.id).unwrap();
        assert!(!root.join("sub").exists());
        assert!(root.exists());
    }

    #[test]
    fn test_snapshot_without_changes_is_empty_delta() {
        let (_temp, root, strata) = setup();
        fs::write(root.join("a.txt"), "a").unwrap();
        strata.snapshot("first").unwrap();

        let second = strata.snapshot("nothing changed").unwrap();
        let stats = &second.scopes["tree"];
        assert_eq!((stats.entries, stats.tombstones), (0, 0));
        assert_eq!(second.layer_bytes(), 0);
    }

    #[test]
    fn test_special_filenames() {
        let (_temp, root, strata) = setup();

        let special_names = vec![
            "file with spaces.txt",
            "file-with-dashes.txt",
            "file.with.dots.txt",
            "file@with#special$chars.txt",
            "file(with)parens.txt",
            "file[with]brackets.txt",
            "file{with}braces.txt",
            "ünïcödé файл.txt",
        ];
        let mut created = Vec::new();
        for name in &special_names {
            if fs::write(root.join(name), format!("Content of {}", name)).is_ok() {
                created.push(*name);
            }
        }

        let snapshot = strata.snapshot("Special names").unwrap();
        for name in &created {
            fs::remove_file(root.join(name)).unwrap();
        }

        strata.restore(&snapshot.id).unwrap();
        for name in &created {
            let content = fs::read_to_string(root.join(name)).unwrap();
            assert_eq!(content, format!("Content of {}", name));
        }
    }

    #[test]
    fn test_zero_byte_and_large_files() {
        let (_temp, root, strata) = setup();
        fs::write(root.join("empty.bin"), b"").unwrap();
        let large: Vec<u8> = (0..3 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        fs::write(root.join("large.bin"), &large).unwrap();

        let snapshot = strata.snapshot("sizes").unwrap();
        fs::write(root.join("empty.bin"), b"no longer empty").unwrap();
        fs::write(root.join("large.bin"), b"truncated").unwrap();

        strata.restore(&snapshot.id).unwrap();
        assert_eq!(fs::read(root.join("empty.bin")).unwrap().len(), 0);
        assert_eq!(fs::read(root.join("large.bin")).unwrap(), large);
    }

    #[test]
    fn test_file_replaced_by_directory() {
        let (_temp, root, strata) = setup();
        fs::write(root.join("thing"), "i am a file").unwrap();
        let as_file = strata.snapshot("file").unwrap();

        fs::remove_file(root.join("thing")).unwrap();
        fs::create_dir_all(root.join("thing")).unwrap();
        fs::write(root.join("thing/inner.txt"), "inside").unwrap();
        let as_dir = strata.snapshot("dir").unwrap();

        strata.restore(&as_file.id).unwrap();
        assert!(root.join("thing").is_file());

        strata.restore(&as_dir.id).unwrap();
        assert_eq!(fs::read_to_string(root.join("thing/inner.txt")).unwrap(), "inside");
    }

    #[test]
    fn test_excluded_paths_survive_restore() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("game");
        fs::create_dir_all(root.join("logs")).unwrap();
        let strata = StrataBuilder::new()
            .scope_with_exclusions("game", &root, ["logs/", "*.tmp"])
            .build(temp_dir.path().join(".strata"))
            .unwrap();

        fs::write(root.join("game.exe"), "binary").unwrap();
        fs::write(root.join("logs/today.log"), "log").unwrap();
        let snapshot = strata.snapshot("base").unwrap();
        assert_eq!(strata.resolve(&snapshot.id, "game").unwrap().len(), 1);

        fs::write(root.join("logs/tomorrow.log"), "more log").unwrap();
        fs::write(root.join("scratch.tmp"), "scratch").unwrap();
        strata.restore(&snapshot.id).unwrap();

        assert!(root.join("logs/tomorrow.log").exists());
        assert!(root.join("scratch.tmp").exists());
        assert!(strata.preview(&snapshot.id).unwrap().change_count() == 0);
    }

    #[test]
    fn test_protected_paths_are_never_deleted() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("game");
        fs::create_dir_all(root.join("saves")).unwrap();
        let strata = StrataBuilder::new()
            .scope("game", &root)
            .protect("game/saves/**")
            .build(temp_dir.path().join(".strata"))
            .unwrap();

        fs::write(root.join("data.pak"), "data").unwrap();
        let snapshot = strata.snapshot("before saves").unwrap();
        fs::write(root.join("saves/slot1.sav"), "progress").unwrap();

        let preview = strata.preview(&snapshot.id).unwrap();
        assert!(!preview.added.contains(&PathBuf::from("game/saves/slot1.sav")));

        let report = strata.restore(&snapshot.id).unwrap();
        assert_eq!(report.summary.protected, 1);
        assert_eq!(fs::read_to_string(root.join("saves/slot1.sav")).unwrap(), "progress");
    }

    #[test]
    fn test_prefix_resolution() {
        let (_temp, root, strata) = setup();
        fs::write(root.join("a"), "a").unwrap();
        let snapshot = strata.snapshot("first").unwrap();

        let found = strata.find_snapshot(&snapshot.id[..6]).unwrap();
        assert_eq!(found.id, snapshot.id);
        assert!(matches!(
            strata.find_snapshot("zzzzzz"),
            Err(StrataError::SnapshotNotFound(_))
        ));
    }

    #[test]
    fn test_scope_validation() {
        let (temp, root, strata) = setup();

        let nested = root.join("nested");
        fs::create_dir_all(&nested).unwrap();
        assert!(matches!(
            strata.add_scope(Scope::new("nested", &nested)),
            Err(StrataError::OverlappingScopes { .. })
        ));
        assert!(matches!(
            strata.add_scope(Scope::new("bad name!", temp.path())),
            Err(StrataError::InvalidScopeName(_))
        ));
        assert!(matches!(
            strata.add_scope(Scope::new("relative", Path::new("relative/dir"))),
            Err(StrataError::InvalidScopePath { .. })
        ));
        assert!(matches!(
            strata.add_scope(Scope::new("storage", strata.storage_path())),
            Err(StrataError::InvalidScopePath { .. })
        ));
        assert_eq!(strata.scopes().len(), 1);
    }

    #[test]
    fn test_snapshot_without_scopes_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let strata = Strata::init(
            temp_dir.path().join(".strata"),
            StrataConfig::new(temp_dir.path().join(".strata")),
        )
        .unwrap();
        let err = strata.snapshot("nothing to track").unwrap_err();
        assert!(matches!(err, StrataError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_init_refuses_existing_store() {
        let (temp, _root, strata) = setup();
        let path = strata.storage_path().to_path_buf();
        drop(strata);
        let err = Strata::init(&path, StrataConfig::new(path.clone())).unwrap_err();
        assert!(matches!(err, StrataError::StorageAlreadyExists(_)));
        assert!(matches!(
            Strata::open(temp.path().join("missing")),
            Err(StrataError::StorageNotInitialized(_))
        ));
    }
}

#[cfg(test)]
mod stress_tests {
    use ::strata::*;
    use std::fs;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn test_symlinks() {
        // This test is Unix-specific
        #[cfg(not(unix))]
        return;

        #[cfg(unix)]
        {
            let temp_dir = TempDir::new().unwrap();
            let root = temp_dir.path().join("tree");
            fs::create_dir_all(&root).unwrap();
            let strata = StrataBuilder::new()
                .scope("tree", &root)
                .build(temp_dir.path().join(".strata"))
                .unwrap();

            fs::write(root.join("target.txt"), "Target content").unwrap();
            std::os::unix::fs::symlink("target.txt", root.join("link.txt")).unwrap();
            // Dangling links are tracked too
            std::os::unix::fs::symlink("does/not/exist", root.join("dangling")).unwrap();

            let snapshot = strata.snapshot("With symlinks").unwrap();
            let manifest = strata.resolve(&snapshot.id, "tree").unwrap();
            assert_eq!(manifest.len(), 3);
            assert!(manifest[std::path::Path::new("link.txt")].is_symlink());

            fs::remove_file(root.join("link.txt")).unwrap();
            fs::remove_file(root.join("dangling")).unwrap();
            fs::remove_file(root.join("target.txt")).unwrap();

            let report = strata.restore(&snapshot.id).unwrap();
            assert_eq!(report.written, 3);
            assert_eq!(
                fs::read_link(root.join("link.txt")).unwrap(),
                std::path::PathBuf::from("target.txt")
            );
            assert_eq!(
                fs::read_link(root.join("dangling")).unwrap(),
                std::path::PathBuf::from("does/not/exist")
            );
            assert_eq!(fs::read_to_string(root.join("link.txt")).unwrap(), "Target content");
        }
    }

    #[test]
    fn test_many_small_files() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("tree");
        for dir in 0..20 {
            let path = root.join(format!("dir_{dir}"));
            fs::create_dir_all(&path).unwrap();
            for file in 0..50 {
                fs::write(path.join(format!("f{file}.txt")), format!("{dir}:{file}")).unwrap();
            }
        }
        let strata = StrataBuilder::new()
            .scope("tree", &root)
            .parallel_workers(4)
            .build(temp_dir.path().join(".strata"))
            .unwrap();

        let snapshot = strata.snapshot("thousand files").unwrap();
        assert_eq!(snapshot.scopes["tree"].entries, 1000);

        fs::remove_dir_all(&root).unwrap();
        fs::create_dir_all(&root).unwrap();
        let report = strata.restore(&snapshot.id).unwrap();
        assert_eq!(report.written, 1000);
        assert_eq!(fs::read_to_string(root.join("dir_7/f13.txt")).unwrap(), "7:13");
    }

    #[test]
    fn test_concurrent_snapshots_serialize() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("tree");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("seed.txt"), "seed").unwrap();
        let strata = Arc::new(
            StrataBuilder::new()
                .scope("tree", &root)
                .build(temp_dir.path().join(".strata"))
                .unwrap(),
        );

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let strata = Arc::clone(&strata);
                thread::spawn(move || strata.snapshot(format!("thread {i}")).map(|s| s.id))
            })
            .collect();
        let ids: Vec<String> = handles.into_iter().map(|h| h.join().unwrap().unwrap()).collect();

        // Commits never interleave: the lineage is a single chain
        let lineage = strata.lineage();
        assert_eq!(lineage.len(), 4);
        assert_eq!(lineage.stats().leaf_snapshots, 1);
        assert_eq!(lineage.stats().max_depth, 3);
        for id in &ids {
            assert!(strata.verify(id).unwrap().is_valid());
        }
    }
}
