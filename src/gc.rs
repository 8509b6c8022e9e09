//! Garbage collection of unreferenced blocks
//!
//! Liveness is computed from the lineage itself, never from refcounts: a
//! block is live when some layer of some retained snapshot has a present
//! entry for it. Refcounts are only bookkeeping; the collector compares them
//! with the counts implied by the layers and repairs any drift it finds.
//!
//! With liveness verification enabled, every candidate is additionally
//! checked against the fully resolved manifests of every snapshot before
//! anything is deleted. A hit aborts the whole collection.

use crate::collections::{HashMap, HashMapExt, HashSet};
use crate::error::{Result, StrataError};
use crate::lineage::LineageGraph;
use crate::resolver::ManifestResolver;
use crate::snapshot::Snapshot;
use crate::storage::Storage;
use crate::utils::{format_bytes, short_id};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// What a collection would do
#[derive(Debug, Clone, Default, Serialize)]
pub struct GcPlan {
    /// Blocks found on disk
    pub blocks_examined: usize,
    /// Blocks reachable from the lineage
    pub live_blocks: usize,
    /// Unreachable blocks and their on-disk size
    pub candidates: Vec<(String, u64)>,
    /// Sum of candidate sizes
    pub bytes_to_reclaim: u64,
    /// Blocks whose stored refcount disagrees with the lineage: (hash, stored, expected)
    pub refcount_drift: Vec<(String, u64, u64)>,
    /// Referenced blocks that are not on disk
    pub missing_blocks: Vec<String>,
    /// Leftover staging files from interrupted ingests
    pub stale_staging: Vec<PathBuf>,
    /// Layer files no snapshot header points at
    pub orphan_layers: Vec<PathBuf>,
}

impl GcPlan {
    /// Whether the collection would change nothing
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
            && self.refcount_drift.is_empty()
            && self.stale_staging.is_empty()
            && self.orphan_layers.is_empty()
    }
}

/// What a collection did
#[derive(Debug, Clone, Default, Serialize)]
pub struct GcReport {
    /// Blocks found on disk
    pub blocks_examined: usize,
    /// Blocks deleted
    pub blocks_deleted: usize,
    /// Bytes freed by deleted blocks
    pub bytes_reclaimed: u64,
    /// Refcounts reset to the lineage count
    pub refcounts_repaired: usize,
    /// Staging files removed
    pub staging_removed: usize,
    /// Orphan layer files removed
    pub orphan_layers_removed: usize,
    /// Referenced blocks that are not on disk
    pub missing_blocks: Vec<String>,
    /// Addresses of deleted blocks
    pub deleted: Vec<String>,
    /// Blocks that could not be deleted, with the reason
    pub failed: Vec<(String, String)>,
    /// Duration in milliseconds
    pub duration_ms: u64,
}

/// Mark-and-sweep over the content store
pub struct GarbageCollector<'a> {
    storage: &'a Storage,
    graph: &'a LineageGraph,
    verify_liveness: bool,
}

impl<'a> GarbageCollector<'a> {
    /// Collector over `storage` for the snapshots in `graph`
    pub fn new(storage: &'a Storage, graph: &'a LineageGraph) -> Self {
        Self {
            storage,
            graph,
            verify_liveness: true,
        }
    }

    /// Enable or disable the resolved-manifest cross-check
    pub fn with_liveness_check(mut self, verify: bool) -> Self {
        self.verify_liveness = verify;
        self
    }

    /// Dry run: compute what [`collect`](Self::collect) would remove
    #[instrument(skip(self))]
    pub fn analyze(&self) -> Result<GcPlan> {
        let resolver = ManifestResolver::new(self.graph, self.storage);
        let expected = self.mark(&resolver)?;
        self.plan_from_marks(&resolver, expected)
    }

    /// Expected refcount of every block: one per present layer entry
    fn mark(&self, resolver: &ManifestResolver<'_>) -> Result<HashMap<String, u64>> {
        let mut expected: HashMap<String, u64> = HashMap::new();
        for snapshot in self.graph.snapshots() {
            let layers = resolver.layers(snapshot)?;
            for hash in layers.referenced_hashes() {
                *expected.entry(hash.to_string()).or_insert(0) += 1;
            }
        }
        Ok(expected)
    }

    fn plan_from_marks(&self, resolver: &ManifestResolver<'_>, expected: HashMap<String, u64>) -> Result<GcPlan> {
        let store = self.storage.store();
        let blocks = store.list_blocks()?;
        let on_disk: HashSet<&str> = blocks.iter().map(String::as_str).collect();
        let mut plan = GcPlan {
            blocks_examined: blocks.len(),
            ..GcPlan::default()
        };

        for hash in &blocks {
            let stored = store.ref_count(hash);
            match expected.get(hash) {
                Some(&count) => {
                    plan.live_blocks += 1;
                    if stored != count {
                        plan.refcount_drift.push((hash.clone(), stored, count));
                    }
                }
                None => {
                    if stored != 0 {
                        plan.refcount_drift.push((hash.clone(), stored, 0));
                    }
                    let size = store.block_size(hash)?;
                    plan.bytes_to_reclaim += size;
                    plan.candidates.push((hash.clone(), size));
                }
            }
        }

        let mut missing: Vec<String> = expected
            .keys()
            .filter(|hash| !on_disk.contains(hash.as_str()))
            .cloned()
            .collect();
        missing.sort();
        for hash in &missing {
            warn!("Block {} is referenced but missing from the store", short_id(hash));
        }
        plan.missing_blocks = missing;

        if self.verify_liveness && !plan.candidates.is_empty() {
            self.check_liveness(resolver, &plan)?;
        }

        plan.stale_staging = store.stale_staging_files()?;
        let snapshots: Vec<Snapshot> = self.graph.snapshots().into_iter().cloned().collect();
        plan.orphan_layers = self.storage.orphan_layer_files(&snapshots)?;

        info!(
            "GC analysis: {} of {} block(s) unreferenced ({}), {} refcount(s) drifted, {} staging file(s), {} orphan layer file(s)",
            plan.candidates.len(),
            plan.blocks_examined,
            format_bytes(plan.bytes_to_reclaim),
            plan.refcount_drift.len(),
            plan.stale_staging.len(),
            plan.orphan_layers.len()
        );
        Ok(plan)
    }

    /// Delete every unreferenced block and clean up leftovers
    #[instrument(skip(self))]
    pub fn collect(&self) -> Result<GcReport> {
        let start = Instant::now();
        let plan = self.analyze()?;
        self.sweep(plan, start)
    }

    /// Apply `plan`; blocks already gone are skipped, failures are reported
    fn sweep(&self, plan: GcPlan, start: Instant) -> Result<GcReport> {
        let store = self.storage.store();
        let mut report = GcReport {
            blocks_examined: plan.blocks_examined,
            missing_blocks: plan.missing_blocks.clone(),
            ..GcReport::default()
        };

        for (hash, stored, expected) in &plan.refcount_drift {
            warn!(
                "Refcount drift on block {}: stored {}, lineage has {}",
                short_id(hash),
                stored,
                expected
            );
            store.set_ref_count(hash, *expected);
            report.refcounts_repaired += 1;
        }

        for (hash, _) in &plan.candidates {
            match store.delete_block(hash) {
                Ok(Some(bytes)) => {
                    report.blocks_deleted += 1;
                    report.bytes_reclaimed += bytes;
                    report.deleted.push(hash.clone());
                }
                Ok(None) => debug!("Block {} was already gone", short_id(hash)),
                Err(e) => {
                    warn!("Failed to delete block {}: {}", short_id(hash), e);
                    report.failed.push((hash.clone(), e.to_string()));
                }
            }
        }

        for path in &plan.stale_staging {
            match fs::remove_file(path) {
                Ok(()) => report.staging_removed += 1,
                Err(e) => warn!("Failed to remove staging file {:?}: {}", path, e),
            }
        }
        for path in &plan.orphan_layers {
            match fs::remove_file(path) {
                Ok(()) => {
                    debug!("Removed orphan layers file {:?}", path);
                    report.orphan_layers_removed += 1;
                }
                Err(e) => warn!("Failed to remove orphan layers file {:?}: {}", path, e),
            }
        }

        store.flush()?;
        report.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Garbage collection complete in {}ms: {} block(s) deleted, {} reclaimed",
            report.duration_ms,
            report.blocks_deleted,
            format_bytes(report.bytes_reclaimed)
        );
        if !report.failed.is_empty() {
            warn!("{} block(s) could not be deleted; the next collection retries them", report.failed.len());
        }
        Ok(report)
    }

    fn check_liveness(&self, resolver: &ManifestResolver<'_>, plan: &GcPlan) -> Result<()> {
        let candidates: HashSet<&str> = plan.candidates.iter().map(|(h, _)| h.as_str()).collect();
        for snapshot in self.graph.snapshots() {
            for manifest in resolver.resolve_all(&snapshot.id)?.values() {
                if let Some(entry) = manifest.values().find(|e| candidates.contains(e.content_hash.as_str())) {
                    return Err(StrataError::GcInvariantViolation {
                        hash: entry.content_hash.clone(),
                        snapshot: snapshot.id.clone(),
                    });
                }
            }
        }
        debug!("Liveness cross-check passed for {} candidate(s)", candidates.len());
        Ok(())
    }
}
