//! Integrity checks for snapshots and the blocks they reference
//!
//! Verification never fails on what it finds: corrupt headers, unreadable
//! layers and bad blocks are recorded in the report. An `Err` means the
//! check itself could not run.

use crate::collections::{HashMap, HashMapExt};
use crate::error::Result;
use crate::lineage::LineageGraph;
use crate::resolver::ManifestResolver;
use crate::snapshot::Snapshot;
use crate::storage::Storage;
use crate::utils::short_id;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Result of checking one block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockCheck {
    /// Block address
    pub hash: String,
    /// Whether the block file exists
    pub exists: bool,
    /// Whether its bytes hash to its address
    pub content_valid: bool,
    /// Whether its logical size matches the entry that references it
    pub size_matches: bool,
    /// What went wrong
    pub error: Option<String>,
}

impl BlockCheck {
    /// Whether every check passed
    pub fn is_valid(&self) -> bool {
        self.exists && self.content_valid && self.size_matches && self.error.is_none()
    }
}

/// Verification of a single snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    /// Snapshot id
    pub snapshot_id: String,
    /// Header state hash matches its fields
    pub header_valid: bool,
    /// Layers file exists and matches the header's digest
    pub layers_valid: bool,
    /// Parent exists (or this is the root)
    pub parent_valid: bool,
    /// Every scope resolves to a manifest
    pub resolvable: bool,
    /// Resolution from the nearest full layer equals a merge from the root
    pub shortcut_consistent: bool,
    /// Checks of blocks referenced by this snapshot's own layers
    pub block_checks: Vec<BlockCheck>,
    /// Time taken in milliseconds
    pub verification_time_ms: u64,
    /// Problems found
    pub errors: Vec<String>,
}

impl VerificationReport {
    fn new(snapshot_id: String) -> Self {
        Self {
            snapshot_id,
            header_valid: false,
            layers_valid: false,
            parent_valid: false,
            resolvable: false,
            shortcut_consistent: false,
            block_checks: Vec::new(),
            verification_time_ms: 0,
            errors: Vec::new(),
        }
    }

    /// Blocks that passed
    pub fn blocks_valid(&self) -> usize {
        self.block_checks.iter().filter(|c| c.is_valid()).count()
    }

    /// Whether the snapshot is fully intact
    pub fn is_valid(&self) -> bool {
        self.header_valid
            && self.layers_valid
            && self.parent_valid
            && self.resolvable
            && self.shortcut_consistent
            && self.blocks_valid() == self.block_checks.len()
            && self.errors.is_empty()
    }

    /// One-line description
    pub fn summary(&self) -> String {
        if self.is_valid() {
            return format!(
                "Snapshot {} is valid ({} blocks verified in {}ms)",
                short_id(&self.snapshot_id),
                self.block_checks.len(),
                self.verification_time_ms
            );
        }
        let issues = [
            (!self.header_valid).then_some("header corrupt"),
            (!self.layers_valid).then_some("layers unreadable"),
            (!self.parent_valid).then_some("parent missing"),
            (!self.resolvable).then_some("unresolvable"),
            (!self.shortcut_consistent).then_some("full layers disagree with delta chain"),
            (self.blocks_valid() < self.block_checks.len()).then_some("bad blocks"),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(", ");
        format!(
            "Snapshot {} is invalid: {} ({}/{} blocks valid)",
            short_id(&self.snapshot_id),
            issues,
            self.blocks_valid(),
            self.block_checks.len()
        )
    }
}

/// Verification of every snapshot in the lineage
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LineageVerificationReport {
    /// Snapshots checked
    pub total_snapshots: usize,
    /// Snapshots that passed
    pub valid_snapshots: usize,
    /// Distinct blocks checked
    pub blocks_checked: usize,
    /// Hashes referenced with more than one size
    pub size_conflicts: Vec<String>,
    /// Per-snapshot reports, oldest first
    pub snapshot_reports: Vec<VerificationReport>,
    /// Errors by snapshot id
    pub snapshot_errors: BTreeMap<String, Vec<String>>,
    /// Time taken in milliseconds
    pub verification_time_ms: u64,
}

impl LineageVerificationReport {
    /// Whether the whole lineage is intact
    pub fn is_valid(&self) -> bool {
        self.valid_snapshots == self.total_snapshots && self.size_conflicts.is_empty()
    }

    /// One-line description
    pub fn summary(&self) -> String {
        if self.is_valid() {
            format!(
                "Lineage is valid: {} snapshots and {} blocks verified in {}ms",
                self.total_snapshots, self.blocks_checked, self.verification_time_ms
            )
        } else {
            format!(
                "Lineage has issues: {}/{} snapshots valid, {} size conflict(s)",
                self.valid_snapshots,
                self.total_snapshots,
                self.size_conflicts.len()
            )
        }
    }
}

/// Checks snapshots against the storage directory
pub struct SnapshotVerifier<'a> {
    storage: &'a Storage,
    graph: &'a LineageGraph,
    resolver: ManifestResolver<'a>,
    // Blocks are shared between snapshots; check each once
    checked: parking_lot::Mutex<HashMap<String, BlockCheck>>,
}

impl<'a> SnapshotVerifier<'a> {
    /// Verifier for the snapshots in `graph`
    pub fn new(storage: &'a Storage, graph: &'a LineageGraph) -> Self {
        Self {
            storage,
            graph,
            resolver: ManifestResolver::new(graph, storage),
            checked: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Verify one snapshot and the blocks its layers reference
    pub fn verify_snapshot(&self, snapshot: &Snapshot) -> Result<VerificationReport> {
        let start = Instant::now();
        let mut report = VerificationReport::new(snapshot.id.clone());

        report.header_valid = snapshot.verify_integrity();
        if !report.header_valid {
            report.errors.push(format!(
                "State hash mismatch: recorded {}, computed {}",
                snapshot.state_hash,
                snapshot.compute_state_hash()
            ));
        }

        report.parent_valid = match &snapshot.parent_id {
            Some(parent) => self.storage.snapshot_exists(parent),
            None => true,
        };
        if !report.parent_valid {
            report.errors.push(format!("Parent {:?} not found", snapshot.parent_id));
        }

        let layers = match self.resolver.layers(snapshot) {
            Ok(layers) => layers,
            Err(e) => {
                report.errors.push(format!("Failed to load layers: {}", e));
                report.verification_time_ms = start.elapsed().as_millis() as u64;
                return Ok(report);
            }
        };
        report.layers_valid = true;

        match self.resolver.resolve_all(&snapshot.id) {
            Ok(manifests) => {
                report.resolvable = true;
                report.shortcut_consistent = true;
                for (scope, manifest) in &manifests {
                    match self.resolver.resolve_full_merge(&snapshot.id, scope) {
                        Ok(merged) if merged == *manifest => {}
                        Ok(_) => {
                            report.shortcut_consistent = false;
                            report.errors.push(format!("Scope '{}' resolves differently from the root merge", scope));
                        }
                        Err(e) => {
                            report.shortcut_consistent = false;
                            report.errors.push(format!("Root merge of scope '{}' failed: {}", scope, e));
                        }
                    }
                }
            }
            Err(e) => report.errors.push(format!("Failed to resolve: {}", e)),
        }

        let mut sizes: BTreeMap<&str, u64> = BTreeMap::new();
        for layer in layers.scopes.values() {
            for entry in layer.entries.values().filter_map(|e| e.as_present()) {
                sizes.insert(entry.content_hash.as_str(), entry.size);
            }
        }
        debug!("Verifying {} block(s) of {}", sizes.len(), snapshot.short_id());
        for (hash, size) in sizes {
            let check = self.check_block(hash, size);
            if !check.is_valid() {
                report.errors.push(format!(
                    "Block {} failed verification: {}",
                    short_id(hash),
                    check.error.as_deref().unwrap_or("size mismatch")
                ));
            }
            report.block_checks.push(check);
        }

        report.verification_time_ms = start.elapsed().as_millis() as u64;
        info!(
            "Verified snapshot {} in {}ms: {} / {} blocks valid",
            snapshot.short_id(),
            report.verification_time_ms,
            report.blocks_valid(),
            report.block_checks.len()
        );
        Ok(report)
    }

    /// Verify every snapshot in the lineage
    pub fn verify_lineage(&self) -> Result<LineageVerificationReport> {
        let start = Instant::now();
        let mut report = LineageVerificationReport::default();
        let mut sizes: HashMap<String, u64> = HashMap::new();

        for snapshot in self.graph.snapshots() {
            report.total_snapshots += 1;
            let snapshot_report = self.verify_snapshot(snapshot)?;
            if snapshot_report.is_valid() {
                report.valid_snapshots += 1;
            } else {
                report
                    .snapshot_errors
                    .insert(snapshot.id.clone(), snapshot_report.errors.clone());
            }
            report.snapshot_reports.push(snapshot_report);

            if let Ok(layers) = self.resolver.layers(snapshot) {
                for entry in layers.scopes.values().flat_map(|l| l.entries.values()).filter_map(|e| e.as_present()) {
                    match sizes.get(&entry.content_hash) {
                        Some(&known) if known != entry.size => {
                            warn!(
                                "Block {} is referenced with sizes {} and {}",
                                short_id(&entry.content_hash),
                                known,
                                entry.size
                            );
                            report.size_conflicts.push(entry.content_hash.clone());
                        }
                        Some(_) => {}
                        None => {
                            sizes.insert(entry.content_hash.clone(), entry.size);
                        }
                    }
                }
            }
        }
        report.size_conflicts.sort();
        report.size_conflicts.dedup();

        report.blocks_checked = self.checked.lock().len();
        report.verification_time_ms = start.elapsed().as_millis() as u64;
        info!(
            "Lineage verification complete in {}ms: {}/{} snapshots valid",
            report.verification_time_ms, report.valid_snapshots, report.total_snapshots
        );
        Ok(report)
    }

    fn check_block(&self, hash: &str, expected_size: u64) -> BlockCheck {
        if let Some(known) = self.checked.lock().get(hash) {
            let mut check = known.clone();
            check.size_matches = check.exists && self.logical_size(hash) == Some(expected_size);
            return check;
        }

        let store = self.storage.store();
        let mut check = BlockCheck {
            hash: hash.to_string(),
            exists: store.contains(hash),
            content_valid: false,
            size_matches: false,
            error: None,
        };
        if !check.exists {
            check.error = Some("block not found".to_string());
        } else {
            match store.verify_block(hash) {
                Ok(()) => check.content_valid = true,
                Err(e) => check.error = Some(e.to_string()),
            }
            check.size_matches = self.logical_size(hash) == Some(expected_size);
        }
        self.checked.lock().insert(hash.to_string(), check.clone());
        check
    }

    fn logical_size(&self, hash: &str) -> Option<u64> {
        self.storage.store().read(hash).ok().map(|reader| reader.logical_size())
    }
}
