//! Chaos testing framework for strata
//!
//! Damages the storage directory and interrupts operations part-way, checking
//! that every problem is detected and reported rather than silently turned
//! into data loss, and that an interrupted restore converges when re-run.

use ::strata::lock::WorldLock;
use ::strata::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;
use tracing::{info, warn};

/// One scope plus its store, with helpers to break things
pub struct StrataChaosTest {
    pub temp_dir: TempDir,
    pub strata: Strata,
    pub chaos_engine: ChaosEngine,
}

impl StrataChaosTest {
    pub fn new() -> Self {
        Self::with_compression(CompressionStrategy::Fast)
    }

    pub fn with_compression(strategy: CompressionStrategy) -> Self {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join("world")).unwrap();
        let strata = StrataBuilder::new()
            .scope("world", temp_dir.path().join("world"))
            .compression_strategy(strategy)
            .parallel_workers(4)
            .build(temp_dir.path().join(".strata"))
            .unwrap();

        Self {
            temp_dir,
            strata,
            chaos_engine: ChaosEngine::new(42),
        }
    }

    pub fn root(&self) -> PathBuf {
        self.temp_dir.path().join("world")
    }

    pub fn storage(&self) -> PathBuf {
        self.strata.storage_path().to_path_buf()
    }

    /// Path of the block file holding `hash`
    pub fn block_path(&self, hash: &str) -> PathBuf {
        self.storage().join("objects").join(&hash[..2]).join(&hash[2..])
    }

    /// Content hash of `relative` at snapshot `id`
    pub fn hash_of(&self, id: &str, relative: &str) -> String {
        let manifest = self.strata.resolve(id, "world").unwrap();
        manifest[Path::new(relative)].content_hash.clone()
    }

    /// Snapshots that each add ten files of unique content
    pub fn create_test_snapshots(&mut self, count: usize) -> anyhow::Result<Vec<String>> {
        let mut ids = Vec::new();
        for i in 0..count {
            let dir = self.root().join(format!("batch_{}", i));
            fs::create_dir_all(&dir)?;
            for j in 0..10 {
                let content = self.chaos_engine.random_bytes(256..2048);
                fs::write(dir.join(format!("file_{}.dat", j)), content)?;
            }
            ids.push(self.strata.snapshot(format!("Test snapshot {}", i))?.id);
        }
        Ok(ids)
    }

    /// Reopen the store from disk
    pub fn reopen(&mut self) -> Result<()> {
        let storage = self.storage();
        self.strata = Strata::open(&storage)?;
        Ok(())
    }
}

/// Chaos engine for introducing failures
pub struct ChaosEngine {
    rng: StdRng,
}

impl ChaosEngine {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn random_bytes(&mut self, size_range: std::ops::Range<usize>) -> Vec<u8> {
        let size = self.rng.random_range(size_range);
        (0..size).map(|_| self.rng.random()).collect()
    }

    /// Flip bytes in the payload of a block file, leaving its header alone
    pub fn corrupt_block(&mut self, path: &Path) -> anyhow::Result<()> {
        let mut content = fs::read(path)?;
        // 4-byte magic + 8-byte logical size
        let header = 12;
        anyhow::ensure!(content.len() > header, "block {:?} has no payload", path);
        let start = self.rng.random_range(header..content.len());
        for byte in content[start..].iter_mut().take(4) {
            *byte ^= 0xFF;
        }
        fs::write(path, content)?;
        Ok(())
    }

    /// Corrupt random files under `dir`
    pub fn corrupt_random_files(&mut self, dir: &Path, count: usize) -> anyhow::Result<Vec<PathBuf>> {
        let mut files = list_files(dir);
        let mut corrupted = Vec::new();
        for _ in 0..count.min(files.len()) {
            let idx = self.rng.random_range(0..files.len());
            let path = files.remove(idx);
            if self.corrupt_block(&path).is_ok() {
                corrupted.push(path);
            }
        }
        Ok(corrupted)
    }

    /// Delete random files under `dir`
    pub fn delete_random_files(&mut self, dir: &Path, count: usize) -> anyhow::Result<Vec<PathBuf>> {
        let mut files = list_files(dir);
        let mut deleted = Vec::new();
        for _ in 0..count.min(files.len()) {
            let idx = self.rng.random_range(0..files.len());
            let path = files.remove(idx);
            if fs::remove_file(&path).is_ok() {
                deleted.push(path);
            }
        }
        Ok(deleted)
    }
}

/// Regular files under `dir`, skipping the staging area
fn list_files(dir: &Path) -> Vec<PathBuf> {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| !e.path().components().any(|c| c.as_os_str() == "tmp"))
        .map(|e| e.path().to_path_buf())
        .collect()
}

/// Contents of every file under `root`
fn disk_state(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| (e.path().strip_prefix(root).unwrap().to_path_buf(), fs::read(e.path()).unwrap()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_corrupted_block_detected_and_contained() {
        let mut chaos = StrataChaosTest::with_compression(CompressionStrategy::None);
        fs::write(chaos.root().join("a.txt"), b"always fine").unwrap();
        let first = chaos.strata.snapshot("first").unwrap();
        fs::write(chaos.root().join("b.bin"), vec![0x5Au8; 4096]).unwrap();
        let second = chaos.strata.snapshot("second").unwrap();

        let block = chaos.block_path(&chaos.hash_of(&second.id, "b.bin"));
        chaos.chaos_engine.corrupt_block(&block).unwrap();

        assert!(chaos.strata.verify(&first.id).unwrap().is_valid());
        let report = chaos.strata.verify(&second.id).unwrap();
        assert!(!report.is_valid());
        assert_eq!(report.block_checks.iter().filter(|c| !c.is_valid()).count(), 1);

        // Snapshots that do not need the block are unaffected
        chaos.strata.restore(&first.id).unwrap();
        assert!(!chaos.root().join("b.bin").exists());

        let err = chaos.strata.restore(&second.id).unwrap_err();
        assert!(err.is_corruption(), "unexpected error: {}", err);
        assert_eq!(err.kind(), ErrorKind::ContentStore);
        // A damaged block never lands at the final path
        assert!(!chaos.root().join("b.bin").exists());
        assert_eq!(fs::read(chaos.root().join("a.txt")).unwrap(), b"always fine");
        assert_eq!(chaos.strata.head().unwrap().id, first.id);
        assert!(logs_contain("Restore aborted"));
    }

    #[test]
    fn test_random_object_corruption_is_reported() {
        let mut chaos = StrataChaosTest::new();
        let ids = chaos.create_test_snapshots(6).unwrap();

        let objects = chaos.storage().join("objects");
        let corrupted = chaos.chaos_engine.corrupt_random_files(&objects, 5).unwrap();
        assert_eq!(corrupted.len(), 5);

        let report = chaos.strata.verify_all().unwrap();
        assert!(!report.is_valid());
        info!("{}", report.summary());

        // Every restore either succeeds exactly or fails loudly
        let mut failures = 0;
        for id in &ids {
            match chaos.strata.restore(id) {
                Ok(_) => assert!(chaos.strata.plan_restore(id).unwrap().is_empty()),
                Err(e) => {
                    warn!("Restore of {} failed: {}", &id[..8], e);
                    assert!(e.is_corruption(), "unexpected error: {}", e);
                    failures += 1;
                }
            }
        }
        assert!(failures > 0);
    }

    #[test]
    fn test_missing_block_reported_not_collected() {
        let mut chaos = StrataChaosTest::new();
        fs::write(chaos.root().join("kept.txt"), b"kept").unwrap();
        fs::write(chaos.root().join("lost.txt"), b"this block goes missing").unwrap();
        let snapshot = chaos.strata.snapshot("base").unwrap();

        let hash = chaos.hash_of(&snapshot.id, "lost.txt");
        fs::remove_file(chaos.block_path(&hash)).unwrap();

        let plan = chaos.strata.gc_analyze().unwrap();
        assert_eq!(plan.missing_blocks, vec![hash.clone()]);
        let gc = chaos.strata.gc().unwrap();
        assert_eq!(gc.missing_blocks, vec![hash.clone()]);
        assert_eq!(gc.blocks_deleted, 0);

        fs::remove_file(chaos.root().join("lost.txt")).unwrap();
        let err = chaos.strata.restore(&snapshot.id).unwrap_err();
        match &err {
            StrataError::RestoreAborted { source, .. } => {
                assert!(matches!(**source, StrataError::BlockNotFound(_)), "unexpected cause: {}", source)
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(err.kind(), ErrorKind::ContentStore);
    }

    #[test]
    fn test_deleted_objects_detected_by_verify() {
        let mut chaos = StrataChaosTest::new();
        chaos.create_test_snapshots(4).unwrap();

        let objects = chaos.storage().join("objects");
        let deleted = chaos.chaos_engine.delete_random_files(&objects, 3).unwrap();
        assert_eq!(deleted.len(), 3);

        let report = chaos.strata.verify_all().unwrap();
        assert!(!report.is_valid());
        assert_eq!(chaos.strata.gc_analyze().unwrap().missing_blocks.len(), 3);
    }

    #[test]
    fn test_tampered_header_refuses_to_open() {
        let mut chaos = StrataChaosTest::new();
        let ids = chaos.create_test_snapshots(3).unwrap();

        let header = chaos.storage().join("snapshots").join(format!("{}.json", ids[1]));
        let json = fs::read_to_string(&header).unwrap();
        fs::write(&header, json.replace("Test snapshot 1", "Tampered label")).unwrap();

        let err = chaos.reopen().unwrap_err();
        assert!(matches!(err, StrataError::InvalidSnapshot { .. }), "unexpected error: {}", err);
        assert_eq!(err.kind(), ErrorKind::Lineage);
        assert!(err.is_corruption());
    }

    #[test]
    fn test_truncated_header_refuses_to_open() {
        let mut chaos = StrataChaosTest::new();
        let ids = chaos.create_test_snapshots(2).unwrap();

        let header = chaos.storage().join("snapshots").join(format!("{}.json", ids[0]));
        let json = fs::read(&header).unwrap();
        fs::write(&header, &json[..json.len() / 2]).unwrap();

        let err = chaos.reopen().unwrap_err();
        assert!(matches!(err, StrataError::InvalidSnapshot { .. }), "unexpected error: {}", err);
    }

    #[test]
    fn test_missing_parent_refuses_to_open() {
        let mut chaos = StrataChaosTest::new();
        let ids = chaos.create_test_snapshots(3).unwrap();

        fs::remove_file(chaos.storage().join("snapshots").join(format!("{}.json", ids[1]))).unwrap();
        let err = chaos.reopen().unwrap_err();
        assert!(matches!(err, StrataError::MissingParent { .. }), "unexpected error: {}", err);
        assert_eq!(err.kind(), ErrorKind::Lineage);
    }

    #[test]
    fn test_missing_layers_fail_resolution() {
        let mut chaos = StrataChaosTest::new();
        let ids = chaos.create_test_snapshots(2).unwrap();

        let manifests = chaos.storage().join("manifests");
        for entry in fs::read_dir(&manifests).unwrap() {
            let path = entry.unwrap().path();
            if path.file_name().unwrap().to_string_lossy().starts_with(&ids[0]) {
                fs::remove_file(path).unwrap();
            }
        }

        // The child's resolution runs through the lost layers
        let err = chaos.strata.resolve(&ids[1], "world").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Lineage);
        assert!(chaos.strata.restore(&ids[1]).is_err());
        assert!(chaos.root().join("batch_1").exists());
    }

    #[test]
    #[traced_test]
    fn test_interrupted_restore_converges() {
        let mut chaos = StrataChaosTest::new();
        fs::write(chaos.root().join("base.txt"), b"base").unwrap();
        let base = chaos.strata.snapshot("base").unwrap();
        chaos.create_test_snapshots(3).unwrap();

        // Cancel after the fifth deletion
        let token = CancelToken::new();
        let steps = Arc::new(AtomicUsize::new(0));
        let callback: ProgressCallback = {
            let token = token.clone();
            let steps = Arc::clone(&steps);
            Arc::new(move |info: ProgressInfo| {
                if info.operation == "Deleting" && steps.fetch_add(1, Ordering::SeqCst) + 1 == 5 {
                    token.cancel();
                }
            })
        };
        let options = RestoreOptions {
            cancel: Some(token),
            progress_callback: Some(callback),
            ..RestoreOptions::default()
        };
        let err = chaos.strata.restore_with_options(&base.id, options).unwrap_err();
        match &err {
            StrataError::RestoreAborted { report, source } => {
                assert!(matches!(**source, StrataError::Cancelled));
                assert!(report.cancelled);
                assert_eq!(report.deleted, 5);
                assert!(report.completed_steps() < report.planned_steps());
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(err.is_recoverable());

        // Completed steps stay applied; the rest is still planned
        let remaining = chaos.strata.plan_restore(&base.id).unwrap();
        assert_eq!(remaining.summary().files_to_delete, 25);

        let report = chaos.strata.restore(&base.id).unwrap();
        assert_eq!(report.deleted, 25);
        let state = disk_state(&chaos.root());
        assert_eq!(state.len(), 1);
        assert_eq!(state[Path::new("base.txt")], b"base");
        assert!(chaos.strata.plan_restore(&base.id).unwrap().is_empty());
    }

    #[test]
    fn test_stale_staging_files_are_cleaned() {
        let mut chaos = StrataChaosTest::new();
        chaos.create_test_snapshots(1).unwrap();

        // Leftovers of an ingest that died before its rename
        let staging = chaos.storage().join("objects").join("tmp");
        fs::create_dir_all(&staging).unwrap();
        fs::write(staging.join("ingest-interrupted"), b"half a block").unwrap();

        let plan = chaos.strata.gc_analyze().unwrap();
        assert_eq!(plan.stale_staging.len(), 1);
        assert!(plan.candidates.is_empty());

        let gc = chaos.strata.gc().unwrap();
        assert_eq!(gc.staging_removed, 1);
        assert!(chaos.strata.verify_all().unwrap().is_valid());
    }

    #[test]
    fn test_lost_refcount_table_is_rebuilt() {
        let mut chaos = StrataChaosTest::new();
        chaos.create_test_snapshots(3).unwrap();
        let before = chaos.strata.store_stats().unwrap();

        fs::write(chaos.storage().join("refcounts.bin"), b"garbage").unwrap();
        chaos.reopen().unwrap();

        let after = chaos.strata.store_stats().unwrap();
        assert_eq!(after.total_references, before.total_references);
        assert!(chaos.strata.gc_analyze().unwrap().refcount_drift.is_empty());
    }

    #[test]
    fn test_world_lock_held_by_other_process() {
        let mut chaos = StrataChaosTest::new();
        let ids = chaos.create_test_snapshots(2).unwrap();

        let other = WorldLock::exclusive(&chaos.storage().join("world.lock")).unwrap();
        for result in [
            chaos.strata.snapshot("blocked").map(|_| ()),
            chaos.strata.restore(&ids[0]).map(|_| ()),
            chaos.strata.prune(&ids[1], PrunePolicy::Reject).map(|_| ()),
            chaos.strata.gc().map(|_| ()),
        ] {
            let err = result.unwrap_err();
            assert!(matches!(err, StrataError::WorldLocked(_)));
            assert!(err.is_recoverable());
        }
        // Read-only queries keep working
        assert_eq!(chaos.strata.list_snapshots().len(), 2);
        assert!(chaos.strata.resolve(&ids[0], "world").is_ok());

        drop(other);
        chaos.strata.snapshot("unblocked").unwrap();
    }

    #[test]
    fn test_concurrent_commits_and_collections() {
        let mut chaos = StrataChaosTest::new();
        chaos.create_test_snapshots(2).unwrap();
        let root = chaos.root();
        let strata = Arc::new(chaos.strata);

        let writer = {
            let strata = Arc::clone(&strata);
            let root = root.clone();
            thread::spawn(move || {
                for i in 0..6 {
                    fs::write(root.join(format!("concurrent_{}.txt", i)), format!("round {}", i)).unwrap();
                    strata.snapshot(format!("round {}", i)).unwrap();
                }
            })
        };
        let collector = {
            let strata = Arc::clone(&strata);
            thread::spawn(move || {
                let mut deleted = 0;
                for _ in 0..6 {
                    deleted += strata.gc().unwrap().blocks_deleted;
                }
                deleted
            })
        };

        writer.join().unwrap();
        // Nothing was ever unreferenced, so nothing may be collected
        assert_eq!(collector.join().unwrap(), 0);

        assert_eq!(strata.list_snapshots().len(), 8);
        assert!(strata.verify_all().unwrap().is_valid());
        let plan = strata.gc_analyze().unwrap();
        assert!(plan.candidates.is_empty());
        assert!(plan.refcount_drift.is_empty());
    }

    #[test]
    fn test_time_anomalies() {
        let mut chaos = StrataChaosTest::new();
        let future = chaos.root().join("future.txt");
        let past = chaos.root().join("past.txt");
        fs::write(&future, b"from the future").unwrap();
        fs::write(&past, b"from the past").unwrap();

        let now = filetime::FileTime::now();
        let year = 365 * 24 * 60 * 60;
        filetime::set_file_mtime(&future, filetime::FileTime::from_unix_time(now.unix_seconds() + year, 0)).unwrap();
        filetime::set_file_mtime(&past, filetime::FileTime::from_unix_time(0, 0)).unwrap();

        let snapshot = chaos.strata.snapshot("odd clocks").unwrap();
        fs::write(&future, b"rewritten").unwrap();
        fs::remove_file(&past).unwrap();

        chaos.strata.restore(&snapshot.id).unwrap();
        assert_eq!(fs::read(&future).unwrap(), b"from the future");
        assert_eq!(
            filetime::FileTime::from_last_modification_time(&fs::metadata(&past).unwrap()).unix_seconds(),
            0
        );
        assert!(chaos.strata.verify(&snapshot.id).unwrap().is_valid());
        assert!(chaos.strata.plan_restore(&snapshot.id).unwrap().is_empty());
    }

    #[test]
    fn test_deep_nesting_and_many_files() {
        let mut chaos = StrataChaosTest::new();
        let mut deep = chaos.root();
        for i in 0..40 {
            deep = deep.join(format!("level_{}", i));
        }
        fs::create_dir_all(&deep).unwrap();
        fs::write(deep.join("deep_file.txt"), b"deep content").unwrap();
        for i in 0..2000 {
            fs::write(chaos.root().join(format!("small_{}.txt", i)), format!("Small file {}", i)).unwrap();
        }

        let snapshot = chaos.strata.snapshot("deep and wide").unwrap();
        assert_eq!(snapshot.scopes["world"].entries, 2001);

        fs::remove_dir_all(chaos.root().join("level_0")).unwrap();
        let report = chaos.strata.restore(&snapshot.id).unwrap();
        assert_eq!(report.written, 1);
        assert_eq!(fs::read(deep.join("deep_file.txt")).unwrap(), b"deep content");
    }
}
