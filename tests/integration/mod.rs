//! Integration tests for strata
//!
//! Drives a two-scope world through branching histories, prunes and
//! collections, checking after every restore that the disk holds exactly
//! the state captured at snapshot time.

use ::strata::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::info;

/// Contents of every file under a root, keyed by relative path
pub type DiskState = BTreeMap<PathBuf, Vec<u8>>;

/// Test harness for multi-scope scenarios
pub struct StrataTestHarness {
    pub temp_dir: TempDir,
    pub strata: Strata,
    pub file_generator: FileGenerator,
    /// State of each scope at each snapshot
    pub expected: BTreeMap<String, BTreeMap<String, DiskState>>,
}

impl StrataTestHarness {
    /// Harness with `game` and `config` scopes
    pub fn new() -> Self {
        Self::with_builder(StrataBuilder::new().compression_strategy(CompressionStrategy::Fast))
    }

    pub fn with_builder(builder: StrataBuilder) -> Self {
        let temp_dir = TempDir::new().unwrap();
        for scope in ["game", "config"] {
            fs::create_dir_all(temp_dir.path().join(scope)).unwrap();
        }
        let strata = builder
            .scope("game", temp_dir.path().join("game"))
            .scope("config", temp_dir.path().join("config"))
            .parallel_workers(4)
            .build(temp_dir.path().join(".strata"))
            .unwrap();

        Self {
            temp_dir,
            strata,
            file_generator: FileGenerator::new(42),
            expected: BTreeMap::new(),
        }
    }

    pub fn scope_root(&self, scope: &str) -> PathBuf {
        self.temp_dir.path().join(scope)
    }

    /// Generate a nested directory structure in `scope`
    pub fn generate_tree(&mut self, scope: &str, config: ProjectConfig) -> anyhow::Result<()> {
        let root = self.scope_root(scope);
        for dir_depth in 1..=config.max_depth {
            for dir_idx in 0..config.dirs_per_level {
                let mut path = root.clone();
                for level in 0..dir_depth {
                    path = path.join(format!("dir_{}_{}", level, dir_idx));
                }
                fs::create_dir_all(&path)?;
                for file_idx in 0..config.files_per_dir {
                    let content = self.file_generator.generate_file_content(config.file_size_range.clone());
                    fs::write(path.join(format!("file_{}.dat", file_idx)), &content)?;
                }
            }
        }
        Ok(())
    }

    /// Apply random modifications, deletions and additions to `scope`
    pub fn mutate(&mut self, scope: &str, mutations: usize, tag: &str) -> anyhow::Result<()> {
        let root = self.scope_root(scope);
        let mut files: Vec<PathBuf> = read_state(&root).into_keys().map(|p| root.join(p)).collect();

        for mutation_idx in 0..mutations {
            match self.file_generator.rng.random_range(0..3) {
                0 if !files.is_empty() => {
                    let idx = self.file_generator.rng.random_range(0..files.len());
                    let content = self.file_generator.generate_file_content(1..4096);
                    fs::write(&files[idx], content)?;
                }
                1 if !files.is_empty() => {
                    let idx = self.file_generator.rng.random_range(0..files.len());
                    fs::remove_file(files.remove(idx))?;
                }
                _ => {
                    let path = root.join(format!("added_{}_{}.dat", tag, mutation_idx));
                    let content = self.file_generator.generate_file_content(1..4096);
                    fs::write(&path, content)?;
                    files.push(path);
                }
            }
        }
        Ok(())
    }

    /// Snapshot and remember what every scope looked like
    pub fn snapshot(&mut self, label: &str) -> Snapshot {
        let snapshot = self.strata.snapshot(label).unwrap();
        let mut states = BTreeMap::new();
        for scope in ["game", "config"] {
            states.insert(scope.to_string(), read_state(&self.scope_root(scope)));
        }
        self.expected.insert(snapshot.id.clone(), states);
        snapshot
    }

    /// Restore and check the disk against the remembered state
    pub fn restore_and_check(&self, id: &str) -> RestoreReport {
        let report = self.strata.restore(id).unwrap();
        for (scope, expected) in &self.expected[id] {
            let actual = read_state(&self.scope_root(scope));
            assert_eq!(
                actual.keys().collect::<Vec<_>>(),
                expected.keys().collect::<Vec<_>>(),
                "paths of scope '{}' differ after restoring {}",
                scope,
                &id[..8]
            );
            assert!(actual == *expected, "content of scope '{}' differs after restoring {}", scope, &id[..8]);
        }
        assert!(self.strata.plan_restore(id).unwrap().is_empty(), "restore is not idempotent");
        report
    }

    /// Verify every snapshot in the lineage
    pub fn verify_lineage(&self) -> LineageVerificationReport {
        let report = self.strata.verify_all().unwrap();
        assert!(report.is_valid(), "{}", report.summary());
        report
    }
}

/// Read every regular file under `root`
pub fn read_state(root: &Path) -> DiskState {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let relative = e.path().strip_prefix(root).unwrap().to_path_buf();
            (relative, fs::read(e.path()).unwrap())
        })
        .collect()
}

/// Seeded generator for file contents
pub struct FileGenerator {
    pub rng: StdRng,
}

impl FileGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Mix of compressible text and random bytes
    pub fn generate_file_content(&mut self, size_range: std::ops::Range<usize>) -> Vec<u8> {
        let size = self.rng.random_range(size_range);
        if self.rng.random_bool(0.5) {
            let line = format!("record {} ", self.rng.random::<u32>());
            line.bytes().cycle().take(size).collect()
        } else {
            (0..size).map(|_| self.rng.random::<u8>()).collect()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProjectConfig {
    pub max_depth: usize,
    pub dirs_per_level: usize,
    pub files_per_dir: usize,
    pub file_size_range: std::ops::Range<usize>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            max_depth: 3,
            dirs_per_level: 3,
            files_per_dir: 5,
            file_size_range: 1..8192,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_branching_navigation() {
        let mut harness = StrataTestHarness::new();
        harness.generate_tree("game", ProjectConfig::default()).unwrap();
        harness.generate_tree("config", ProjectConfig { max_depth: 1, ..ProjectConfig::default() }).unwrap();
        let vanilla = harness.snapshot("Vanilla");

        // Two mod lists branching off vanilla
        let mut branches: Vec<Vec<String>> = Vec::new();
        for branch in 0..2 {
            harness.restore_and_check(&vanilla.id);
            let mut ids = Vec::new();
            for step in 0..3 {
                harness.mutate("game", 15, &format!("b{branch}s{step}")).unwrap();
                harness.mutate("config", 3, &format!("b{branch}s{step}")).unwrap();
                ids.push(harness.snapshot(&format!("branch {branch} step {step}")).id);
            }
            branches.push(ids);
        }
        assert_eq!(harness.strata.lineage().stats().branch_points, 1);

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..8 {
            let branch = &branches[rng.random_range(0..branches.len())];
            let target = &branch[rng.random_range(0..branch.len())];
            info!("Navigating to {}", &target[..8]);
            harness.restore_and_check(target);
            assert_eq!(harness.strata.head().unwrap().id, *target);
        }
        harness.restore_and_check(&vanilla.id);
        harness.verify_lineage();
    }

    #[test]
    fn test_cross_scope_deduplication() {
        let mut harness = StrataTestHarness::new();
        let payload = vec![0xA5u8; 64 * 1024];
        fs::write(harness.scope_root("game").join("shared.bin"), &payload).unwrap();
        fs::write(harness.scope_root("config").join("copy.bin"), &payload).unwrap();
        fs::create_dir_all(harness.scope_root("game").join("deep/er")).unwrap();
        fs::write(harness.scope_root("game").join("deep/er/again.bin"), &payload).unwrap();
        harness.snapshot("three copies");

        let stats = harness.strata.store_stats().unwrap();
        assert_eq!(stats.block_count, 1);
        assert_eq!(stats.total_references, 3);
        // Highly compressible payload is stored compressed
        assert!(stats.stored_bytes < payload.len() as u64);
    }

    #[test]
    fn test_prune_middle_of_branch_keeps_every_state() {
        let mut harness = StrataTestHarness::new();
        harness.generate_tree("game", ProjectConfig::default()).unwrap();
        let root = harness.snapshot("root");
        let mut chain = vec![root.id.clone()];
        for step in 0..4 {
            harness.mutate("game", 10, &format!("s{step}")).unwrap();
            chain.push(harness.snapshot(&format!("step {step}")).id);
        }
        // A sibling branch off step 1
        harness.restore_and_check(&chain[2]);
        harness.mutate("game", 10, "sibling").unwrap();
        let sibling = harness.snapshot("sibling").id;

        // Step 1 has two children now
        let report = harness.strata.prune(&chain[2], PrunePolicy::Reparent).unwrap();
        assert_eq!(report.reparented.len(), 2);
        harness.expected.remove(&chain[2]);

        for id in [&chain[1], &chain[3], &chain[4], &sibling] {
            harness.restore_and_check(id);
        }
        harness.verify_lineage();
        let gc = harness.strata.gc().unwrap();
        assert!(gc.missing_blocks.is_empty());
        harness.restore_and_check(&chain[4]);
    }

    #[test]
    fn test_cascade_prune_and_gc_reclaim() {
        let mut harness = StrataTestHarness::new();
        harness.generate_tree("game", ProjectConfig::default()).unwrap();
        let vanilla = harness.snapshot("Vanilla");
        let before = harness.strata.store_stats().unwrap();

        harness.mutate("game", 30, "modded").unwrap();
        let modded = harness.snapshot("modded");
        harness.mutate("game", 30, "more").unwrap();
        harness.snapshot("more mods");

        let prune = harness.strata.prune(&modded.id, PrunePolicy::Cascade).unwrap();
        assert_eq!(prune.removed.len(), 2);
        assert_eq!(prune.new_head.as_deref(), Some(vanilla.id.as_str()));

        let plan = harness.strata.gc_analyze().unwrap();
        assert_eq!(plan.candidates.len(), prune.blocks_now_unreferenced);
        let gc = harness.strata.gc().unwrap();
        assert_eq!(gc.blocks_deleted, plan.candidates.len());
        assert_eq!(harness.strata.store_stats().unwrap().block_count, before.block_count);

        harness.restore_and_check(&vanilla.id);
        harness.verify_lineage();
    }

    #[test]
    fn test_full_manifest_interval_restores_identically() {
        let mut harness = StrataTestHarness::with_builder(StrataBuilder::new().full_manifest_interval(Some(3)));
        harness.generate_tree("game", ProjectConfig::default()).unwrap();
        let mut ids = vec![harness.snapshot("gen 0").id];
        for step in 1..8 {
            harness.mutate("game", 8, &format!("g{step}")).unwrap();
            ids.push(harness.snapshot(&format!("gen {step}")).id);
        }

        let full: Vec<bool> = harness
            .strata
            .list_snapshots()
            .iter()
            .map(|s| s.scopes["game"].full)
            .collect();
        assert_eq!(full, vec![true, false, false, true, false, false, true, false]);

        for id in ids.iter().rev() {
            harness.restore_and_check(id);
        }
        for report in harness.verify_lineage().snapshot_reports {
            assert!(report.shortcut_consistent);
        }
    }

    #[test]
    fn test_state_survives_reopen() {
        let mut harness = StrataTestHarness::new();
        harness.generate_tree("game", ProjectConfig::default()).unwrap();
        let first = harness.snapshot("first");
        harness.mutate("game", 10, "second").unwrap();
        let second = harness.snapshot("second");

        let storage = harness.strata.storage_path().to_path_buf();
        let reopened = Strata::open(&storage).unwrap();
        assert_eq!(reopened.list_snapshots().len(), 2);
        assert_eq!(reopened.head().unwrap().id, second.id);
        assert_eq!(reopened.scopes().len(), 2);

        // Builder on an existing store keeps the configuration
        drop(reopened);
        harness.strata = StrataBuilder::new()
            .scope("game", harness.scope_root("game"))
            .build(&storage)
            .unwrap();
        assert_eq!(harness.strata.scopes().len(), 2);
        harness.restore_and_check(&first.id);
    }

    #[test]
    fn test_trust_mtime_restore() {
        let mut harness = StrataTestHarness::new();
        harness.generate_tree("game", ProjectConfig::default()).unwrap();
        let base = harness.snapshot("base");
        harness.mutate("game", 20, "edit").unwrap();
        harness.snapshot("edited");

        let options = RestoreOptions {
            trust_mtime: true,
            ..RestoreOptions::default()
        };
        harness.strata.restore_with_options(&base.id, options).unwrap();
        for (scope, expected) in &harness.expected[&base.id] {
            assert!(read_state(&harness.scope_root(scope)) == *expected);
        }
    }

    #[test]
    fn test_selected_scope_snapshot_inherits_others() {
        let mut harness = StrataTestHarness::new();
        fs::write(harness.scope_root("game").join("game.bin"), b"v1").unwrap();
        fs::write(harness.scope_root("config").join("settings.ini"), b"low").unwrap();
        let base = harness.snapshot("base");

        fs::write(harness.scope_root("game").join("game.bin"), b"v2").unwrap();
        fs::write(harness.scope_root("config").join("settings.ini"), b"ultra").unwrap();
        let options = SnapshotOptions {
            scopes: Some(vec!["config".to_string()]),
            ..SnapshotOptions::labeled("config only")
        };
        let config_only = harness.strata.snapshot_with_options(options).unwrap();
        assert!(!config_only.has_layer("game"));

        let game = harness.strata.resolve(&config_only.id, "game").unwrap();
        assert_eq!(game, harness.strata.resolve(&base.id, "game").unwrap());
        harness.strata.restore(&config_only.id).unwrap();
        assert_eq!(fs::read(harness.scope_root("game").join("game.bin")).unwrap(), b"v1");
        assert_eq!(fs::read(harness.scope_root("config").join("settings.ini")).unwrap(), b"ultra");
    }
}
