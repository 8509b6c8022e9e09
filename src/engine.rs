//! Main strata API
//!
//! [`Strata`] ties the components together: it owns the storage directory,
//! the scope configuration and the lineage graph, and exposes the world-level
//! operations (snapshot, restore, prune, preview, gc).
//!
//! ## Locking
//!
//! Every operation that changes persisted state holds the world lock for its
//! whole duration: an in-process `RwLock` plus an exclusive advisory lock on
//! `world.lock`, so commits, restores, prunes and collections never overlap,
//! even across processes. Preview and restore planning take the shared side.
//! Plain queries (listing, resolving) only read the in-memory graph.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use strata::StrataBuilder;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let strata = StrataBuilder::new()
//!     .scope("game", "/games/skyrim")
//!     .scope("config", "/home/me/.config/skyrim")
//!     .build(".strata")?;
//!
//! let vanilla = strata.bootstrap()?;
//! // ... install mods ...
//! let modded = strata.snapshot("heavy mod list")?;
//!
//! println!("{:?}", strata.preview(&vanilla.id)?.change_count());
//! strata.restore(&vanilla.id)?;
//! strata.restore(&modded.id)?;
//! # Ok(())
//! # }
//! ```

use crate::collections::{HashMap, HashMapExt};
use crate::compression::CompressionStrategy;
use crate::error::{Result, StrataError};
use crate::gc::{GarbageCollector, GcPlan, GcReport};
use crate::lineage::{LineageGraph, LineageNode};
use crate::lock::WorldLock;
use crate::reconcile::{Reconciler, RestorePlan, RestoreReport};
use crate::resolver::{layer_between, ManifestResolver};
use crate::scanner::{ExclusionMatcher, Scanner};
use crate::scope::{Scope, ScopeManager};
use crate::snapshot::{fold_layers, into_root_layer, Snapshot, SnapshotLayers};
use crate::storage::Storage;
use crate::store::StoreStats;
use crate::types::{
    ChangeSet, EntryKind, FileEntry, Layer, Manifest, PrunePolicy, PruneReport, RestoreOptions, SnapshotOptions,
    SnapshotSize, StrataConfig, MetadataFidelity,
};
use crate::utils::{self, format_bytes, short_id};
use crate::verify::{LineageVerificationReport, SnapshotVerifier, VerificationReport};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Label of the root snapshot created by [`Strata::bootstrap`]
pub const VANILLA_LABEL: &str = "Vanilla";

/// Holds the world lock for the duration of an operation
struct WorldGuard<'a> {
    _shared: Option<RwLockReadGuard<'a, ()>>,
    _exclusive: Option<RwLockWriteGuard<'a, ()>>,
    _file: WorldLock,
}

/// Snapshot engine over a set of scopes
pub struct Strata {
    storage: Arc<Storage>,
    config: StrataConfig,
    scopes: RwLock<ScopeManager>,
    graph: RwLock<LineageGraph>,
    world: RwLock<()>,
}

impl std::fmt::Debug for Strata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Strata")
            .field("storage", &self.storage.root())
            .field("scopes", &self.scopes.read().len())
            .field("snapshots", &self.graph.read().len())
            .field("head", &self.graph.read().head_id().map(String::from))
            .finish()
    }
}

impl Strata {
    /// Initialize a new store at `storage_path`
    ///
    /// # Errors
    ///
    /// Fails with [`StrataError::StorageAlreadyExists`] if the directory
    /// already holds a store or any other data.
    pub fn init(storage_path: impl AsRef<Path>, mut config: StrataConfig) -> Result<Self> {
        let root = prepare_storage_dir(storage_path.as_ref())?;
        config.storage_path = root.clone();
        config.parallel_workers = config.parallel_workers.max(1);
        let storage = Storage::init(root.clone(), config.clone())?;
        info!("Initialized strata at {:?}", root);
        Ok(Self {
            storage: Arc::new(storage),
            config,
            scopes: RwLock::new(ScopeManager::new(&root)),
            graph: RwLock::new(LineageGraph::new()),
            world: RwLock::new(()),
        })
    }

    /// Open an existing store
    ///
    /// Loads every snapshot header and rebuilds the lineage. If the refcount
    /// table was lost it is recounted from the layers.
    ///
    /// # Errors
    ///
    /// Fails on a missing store, a header that fails its integrity check or
    /// a lineage with a second root, a missing parent or a cycle.
    #[instrument(skip_all)]
    pub fn open(storage_path: impl AsRef<Path>) -> Result<Self> {
        let root = fs::canonicalize(storage_path.as_ref())
            .map_err(|_| StrataError::StorageNotInitialized(storage_path.as_ref().to_path_buf()))?;
        let storage = Storage::open(root.clone())?;
        let mut config = storage.config();
        config.storage_path = root.clone();

        let scopes = ScopeManager::from_persisted(&root, storage.load_scopes()?)?;
        let mut snapshots = Vec::new();
        for id in storage.list_snapshot_ids()? {
            snapshots.push(storage.load_snapshot(&id)?);
        }
        let head = storage.load_head()?.head;
        let graph = LineageGraph::from_snapshots(snapshots, head)?;
        debug!("Loaded {} snapshot(s), head {:?}", graph.len(), graph.head_id());

        let strata = Self {
            storage: Arc::new(storage),
            config,
            scopes: RwLock::new(scopes),
            graph: RwLock::new(graph),
            world: RwLock::new(()),
        };
        if strata.storage.store().needs_recount() {
            strata.recount_references()?;
        }
        Ok(strata)
    }

    fn exclusive(&self) -> Result<WorldGuard<'_>> {
        let local = self.world.write();
        let file = WorldLock::exclusive(&self.storage.lock_path())?;
        Ok(WorldGuard {
            _shared: None,
            _exclusive: Some(local),
            _file: file,
        })
    }

    fn shared(&self) -> Result<WorldGuard<'_>> {
        let local = self.world.read();
        let file = WorldLock::shared(&self.storage.lock_path())?;
        Ok(WorldGuard {
            _shared: Some(local),
            _exclusive: None,
            _file: file,
        })
    }

    fn scanner(&self) -> Scanner {
        Scanner::new(self.storage.root().to_path_buf())
            .with_parallel_workers(self.config.parallel_workers)
            .with_ignore_junk_files(self.config.ignore_junk_files)
    }

    /// Rebuild every block's refcount from the layers of all snapshots
    fn recount_references(&self) -> Result<()> {
        warn!("Refcount table missing or unreadable, recounting from the lineage");
        let graph = self.graph.read();
        let resolver = ManifestResolver::new(&graph, &*self.storage);
        let mut counts: HashMap<String, u64> = HashMap::new();
        for snapshot in graph.snapshots() {
            for hash in resolver.layers(snapshot)?.referenced_hashes() {
                *counts.entry(hash.to_string()).or_insert(0) += 1;
            }
        }
        info!("Recounted references for {} block(s)", counts.len());
        self.storage.store().rebuild_ref_counts(counts)
    }

    // ---- snapshots ----

    /// Snapshot every scope as a child of the current head
    ///
    /// On an empty lineage this creates the root snapshot.
    pub fn snapshot(&self, label: impl Into<String>) -> Result<Snapshot> {
        self.snapshot_with_options(SnapshotOptions::labeled(label))
    }

    /// Create the root "Vanilla" snapshot if the lineage is empty
    ///
    /// Returns the existing root otherwise.
    pub fn bootstrap(&self) -> Result<Snapshot> {
        if let Some(root) = self.graph.read().root() {
            debug!("Lineage already has root {}", root.short_id());
            return Ok(root.clone());
        }
        self.snapshot_with_options(SnapshotOptions::labeled(VANILLA_LABEL))
    }

    /// Snapshot with explicit options
    ///
    /// Each selected scope is scanned against its state at the head and a
    /// layer holding only the differences is stored (or a full layer on the
    /// root and at every `full_manifest_interval`). New content is ingested
    /// before anything else is written; the snapshot becomes visible when its
    /// header is written and then becomes the head.
    ///
    /// # Errors
    ///
    /// - [`StrataError::PartialScan`] when a path could not be read and
    ///   `allow_partial` is not set
    /// - [`StrataError::UnknownScope`] for an unknown selected scope
    /// - content store errors during ingestion, in which case every
    ///   reference taken by this commit is released again
    #[instrument(skip(self, options), fields(label = %options.label))]
    pub fn snapshot_with_options(&self, options: SnapshotOptions) -> Result<Snapshot> {
        let _world = self.exclusive()?;
        let start = Instant::now();
        let scopes = self.selected_scopes(options.scopes.as_deref())?;

        let (parent_id, layers, partial) = {
            let graph = self.graph.read();
            let parent_id = graph.head_id().map(String::from);
            let depth = match &parent_id {
                Some(parent) => graph.depth(parent)? + 1,
                None => 0,
            };
            let full = parent_id.is_none()
                || matches!(self.config.full_manifest_interval, Some(n) if n > 0 && depth % n == 0);

            let resolver = ManifestResolver::new(&graph, &*self.storage);
            let scanner = self.scanner();
            let mut layers = BTreeMap::new();
            let mut partial = false;
            for scope in &scopes {
                let baseline = match &parent_id {
                    Some(parent) => resolver.resolve(parent, &scope.name)?,
                    None => Manifest::new(),
                };
                let output = scanner.scan(scope, Some(&baseline), options.progress_callback.as_ref())?;
                if output.changes.partial {
                    for issue in &output.changes.issues {
                        warn!("Unreadable path in scope '{}': {:?} ({})", scope.name, issue.path, issue.reason);
                    }
                    if !options.allow_partial {
                        return Err(StrataError::PartialScan {
                            scope: scope.name.clone(),
                            issues: output.changes.issues.len(),
                        });
                    }
                    partial = true;
                }
                debug!(
                    "Scope '{}': {} added, {} modified, {} removed, {} metadata-only",
                    scope.name,
                    output.changes.added.len(),
                    output.changes.modified.len(),
                    output.changes.removed.len(),
                    output.changes.metadata_only.len()
                );
                layers.insert(scope.name.clone(), layer_between(&baseline, &output.live, full));
            }
            (parent_id, layers, partial)
        };

        let id = Snapshot::generate_id();
        let mut snapshot_layers = SnapshotLayers::new(id.clone());
        snapshot_layers.scopes = layers;

        let retained = Mutex::new(Vec::new());
        let committed = self
            .ingest_layers(&snapshot_layers, &scopes, &retained)
            .and_then(|created| {
                let snapshot = Snapshot::new(id.clone(), parent_id.clone(), options.label.clone(), &snapshot_layers, partial)?;
                self.storage.store_layers(&snapshot_layers)?;
                self.storage.store_snapshot(&snapshot)?;
                Ok((snapshot, created))
            });
        let (snapshot, created) = match committed {
            Ok(done) => done,
            Err(e) => {
                self.release_all(retained.into_inner());
                return Err(e);
            }
        };

        // The snapshot exists from here on
        self.storage.save_head(Some(&snapshot.id))?;
        self.storage.store().flush()?;
        {
            let mut graph = self.graph.write();
            graph.insert(snapshot.clone())?;
            graph.set_head(&snapshot.id)?;
        }

        info!(
            "Created snapshot {} '{}' in {:?}: {} scope(s), {} new block(s), {} in layers{}",
            snapshot.short_id(),
            snapshot.label,
            start.elapsed(),
            snapshot.scopes.len(),
            created,
            format_bytes(snapshot.layer_bytes()),
            if snapshot.partial { " (partial)" } else { "" }
        );
        Ok(snapshot)
    }

    fn selected_scopes(&self, names: Option<&[String]>) -> Result<Vec<Scope>> {
        let manager = self.scopes.read();
        if manager.is_empty() {
            return Err(StrataError::InvalidConfiguration("no scopes are configured".to_string()));
        }
        match names {
            None => Ok(manager.iter().cloned().collect()),
            Some(names) => names.iter().map(|name| manager.require(name).cloned()).collect(),
        }
    }

    /// Take one reference per present entry, storing content not yet in the store
    fn ingest_layers(&self, layers: &SnapshotLayers, scopes: &[Scope], retained: &Mutex<Vec<String>>) -> Result<usize> {
        let by_name: BTreeMap<&str, &Scope> = scopes.iter().map(|s| (s.name.as_str(), s)).collect();
        let mut work: Vec<(PathBuf, &FileEntry)> = Vec::with_capacity(layers.entry_count());
        for (scope_name, layer) in &layers.scopes {
            let scope = by_name
                .get(scope_name.as_str())
                .ok_or_else(|| StrataError::UnknownScope(scope_name.clone()))?;
            for (relative, entry) in &layer.entries {
                if let Some(entry) = entry.as_present() {
                    work.push((scope.absolute(relative), entry));
                }
            }
        }

        let store = self.storage.store();
        let created = AtomicUsize::new(0);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.parallel_workers)
            .build()?;
        pool.install(|| {
            work.par_iter().try_for_each(|(path, entry)| -> Result<()> {
                let outcome_hash = match &entry.kind {
                    EntryKind::Symlink { target } => store.ingest(&utils::symlink_content(target))?,
                    EntryKind::File => {
                        let outcome = store.ingest_file(path, &entry.content_hash)?;
                        if outcome.created {
                            created.fetch_add(1, Ordering::Relaxed);
                        }
                        outcome.hash
                    }
                };
                retained.lock().push(outcome_hash.clone());
                if outcome_hash != entry.content_hash {
                    return Err(StrataError::HashMismatch {
                        expected: entry.content_hash.clone(),
                        actual: outcome_hash,
                    });
                }
                Ok(())
            })
        })?;
        Ok(created.into_inner())
    }

    fn release_all(&self, hashes: Vec<String>) {
        let store = self.storage.store();
        for hash in &hashes {
            if let Err(e) = store.release(hash) {
                warn!("Failed to release block {}: {}", short_id(hash), e);
            }
        }
        if let Err(e) = store.flush() {
            warn!("Failed to persist refcounts after abort: {}", e);
        }
        debug!("Released {} reference(s) of an aborted commit", hashes.len());
    }

    // ---- restore ----

    /// Make every scope exactly match snapshot `id`
    ///
    /// See [`restore_with_options`](Self::restore_with_options).
    pub fn restore(&self, id: &str) -> Result<RestoreReport> {
        self.restore_with_options(id, RestoreOptions::default())
    }

    /// Restore with explicit options
    ///
    /// Plans every scope against a fresh scan, then deletes extraneous files,
    /// removes emptied directories, writes missing or differing files and
    /// fixes metadata. Scopes the target has no history for are skipped. On
    /// success the target becomes the head.
    ///
    /// # Errors
    ///
    /// A failure part-way through is returned as
    /// [`StrataError::RestoreAborted`] with a report of the completed steps.
    /// Nothing is rolled back; the same restore can be run again to finish.
    #[instrument(skip(self, options))]
    pub fn restore_with_options(&self, id: &str, options: RestoreOptions) -> Result<RestoreReport> {
        let _world = self.exclusive()?;
        let plan = self.build_restore_plan(id, &options)?;
        self.apply_restore_plan(&plan, &options)
    }

    /// Compute what restoring `id` would do, without changing anything
    pub fn plan_restore(&self, id: &str) -> Result<RestorePlan> {
        self.plan_restore_with_options(id, &RestoreOptions::default())
    }

    /// [`plan_restore`](Self::plan_restore) honouring `allow_partial`,
    /// `trust_mtime` and the progress callback of `options`
    pub fn plan_restore_with_options(&self, id: &str, options: &RestoreOptions) -> Result<RestorePlan> {
        let _world = self.shared()?;
        self.build_restore_plan(id, options)
    }

    /// Execute a plan from [`plan_restore_with_options`](Self::plan_restore_with_options)
    ///
    /// Used to show a plan before carrying it out without scanning twice. The
    /// disk may have changed since planning; anything the plan missed is
    /// picked up by the next restore.
    #[instrument(skip_all, fields(target = %plan.target))]
    pub fn execute_restore(&self, plan: &RestorePlan, options: RestoreOptions) -> Result<RestoreReport> {
        let _world = self.exclusive()?;
        self.graph.read().require(&plan.target)?;
        self.apply_restore_plan(plan, &options)
    }

    fn apply_restore_plan(&self, plan: &RestorePlan, options: &RestoreOptions) -> Result<RestoreReport> {
        let reconciler = Reconciler::new(self.storage.store(), &self.config)?;
        let scopes: Vec<Scope> = self.scopes.read().iter().cloned().collect();
        let report = reconciler.execute(
            plan,
            &scopes,
            options.cancel.as_ref(),
            options.progress_callback.as_ref(),
        )?;

        self.storage.save_head(Some(&plan.target))?;
        self.graph.write().set_head(&plan.target)?;
        Ok(report)
    }

    fn build_restore_plan(&self, id: &str, options: &RestoreOptions) -> Result<RestorePlan> {
        let graph = self.graph.read();
        let target = graph.resolve_prefix(id)?.id.clone();
        let resolver = ManifestResolver::new(&graph, &*self.storage);
        let reconciler = Reconciler::new(self.storage.store(), &self.config)?;
        let scanner = self.scanner();

        let mut plan = RestorePlan {
            target: target.clone(),
            ..RestorePlan::default()
        };
        for scope in self.scopes.read().iter() {
            if !resolver.has_history(&target, &scope.name)? {
                info!(
                    "Scope '{}' has no history at {}, leaving it untouched",
                    scope.name,
                    short_id(&target)
                );
                plan.skipped_scopes.push(scope.name.clone());
                continue;
            }
            let manifest = resolver.resolve(&target, &scope.name)?;
            let baseline = options.trust_mtime.then_some(&manifest);
            let output = scanner.scan(scope, baseline, options.progress_callback.as_ref())?;
            if output.changes.partial && !options.allow_partial {
                return Err(StrataError::PartialScan {
                    scope: scope.name.clone(),
                    issues: output.changes.issues.len(),
                });
            }
            plan.scopes.push(reconciler.plan_scope(scope, &manifest, &output.live)?);
        }
        info!("Restore plan for {}: {}", short_id(&target), plan.summary());
        Ok(plan)
    }

    /// Differences between the disk and snapshot `id`, without touching disk
    ///
    /// The change set is classified with the target as the baseline and the
    /// disk as the live side, keyed `scope/relative`. So `added` lists what a
    /// restore would delete, `removed` what it would write back, `modified`
    /// what it would overwrite and `metadata_only` what it would touch.
    /// Protected and excluded paths are left out, as restore leaves them alone.
    pub fn preview(&self, id: &str) -> Result<ChangeSet> {
        let _world = self.shared()?;
        let graph = self.graph.read();
        let target = graph.resolve_prefix(id)?.id.clone();
        let resolver = ManifestResolver::new(&graph, &*self.storage);
        let reconciler = Reconciler::new(self.storage.store(), &self.config)?;
        let scanner = self.scanner();

        let mut total = ChangeSet::default();
        for scope in self.scopes.read().iter() {
            if !resolver.has_history(&target, &scope.name)? {
                continue;
            }
            let exclusions = ExclusionMatcher::new(scope)?;
            let mut manifest = resolver.resolve(&target, &scope.name)?;
            manifest.retain(|path, _| !exclusions.is_excluded(path));

            let mut output = scanner.scan(scope, Some(&manifest), None)?;
            output.changes.added.retain(|path| !reconciler.is_protected(scope, path));
            total.absorb(&scope.name, output.changes);
        }
        debug!("Preview of {}: {} change(s)", short_id(&target), total.change_count());
        Ok(total)
    }

    // ---- prune ----

    /// Remove snapshot `id` from the lineage
    ///
    /// Under [`PrunePolicy::Reparent`] each child takes over the pruned
    /// snapshot's changes and moves to its parent, so every remaining
    /// snapshot resolves exactly as before. Blocks are not deleted here; run
    /// [`gc`](Self::gc) to reclaim them.
    ///
    /// # Errors
    ///
    /// [`StrataError::SnapshotHasChildren`] under [`PrunePolicy::Reject`]
    /// when the snapshot has children, and under `Reparent` for a root with
    /// more than one child.
    #[instrument(skip(self))]
    pub fn prune(&self, id: &str, policy: PrunePolicy) -> Result<PruneReport> {
        let _world = self.exclusive()?;
        let store = self.storage.store();
        let mut graph = self.graph.write();
        let target = graph.resolve_prefix(id)?.id.clone();
        let plan = graph.plan_removal(&target, policy)?;
        info!(
            "Prune plan for {}: remove {} snapshot(s), reparent {} child(ren) onto {}",
            short_id(&target),
            plan.removed.len(),
            plan.reparented.len(),
            plan.new_parent.as_deref().map(short_id).unwrap_or("nothing (new root)")
        );

        let mut report = PruneReport {
            removed: plan.removed.clone(),
            reparented: plan.reparented.clone(),
            new_head: plan.new_head.clone().flatten(),
            ..PruneReport::default()
        };
        let mut released = BTreeSet::new();
        let mut reattached = Vec::new();
        {
            let resolver = ManifestResolver::new(&graph, &*self.storage);
            let pruned = graph.require(&target)?;

            for child_id in &plan.reparented {
                let child = graph.require(child_id)?;
                let pruned_layers = resolver.layers(pruned)?;
                let child_layers = resolver.layers(child)?;
                let folded = reparent_layers(&pruned_layers, &child_layers, plan.new_parent.is_none());

                for hash in folded.referenced_hashes() {
                    store.retain(hash)?;
                }
                let mut moved = child.clone();
                moved.reattach(plan.new_parent.clone(), &folded)?;
                self.storage.store_layers(&folded)?;
                self.storage.store_snapshot(&moved)?;
                self.storage.delete_layers_file(&child.id, &child.layers_digest)?;
                for hash in child_layers.referenced_hashes() {
                    store.release(hash)?;
                    report.references_released += 1;
                    released.insert(hash.to_string());
                }
                debug!("Reattached {} to {:?}", moved.short_id(), moved.parent_id);
                reattached.push(moved);
            }

            if let Some(new_head) = &plan.new_head {
                self.storage.save_head(new_head.as_deref())?;
            }

            for removed_id in &plan.removed {
                let snapshot = graph.require(removed_id)?;
                let layers = resolver.layers(snapshot)?;
                self.storage.delete_snapshot(snapshot)?;
                for hash in layers.referenced_hashes() {
                    store.release(hash)?;
                    report.references_released += 1;
                    released.insert(hash.to_string());
                }
            }
        }
        store.flush()?;
        graph.apply_removal(&plan, reattached)?;

        for hash in released.iter().filter(|h| store.ref_count(h) == 0) {
            report.blocks_now_unreferenced += 1;
            report.bytes_reclaimable += store.block_size(hash).unwrap_or(0);
        }
        info!(
            "Pruned {} snapshot(s): {} reference(s) released, {} block(s) ({}) now reclaimable",
            report.removed.len(),
            report.references_released,
            report.blocks_now_unreferenced,
            format_bytes(report.bytes_reclaimable)
        );
        Ok(report)
    }

    // ---- garbage collection ----

    /// Delete every block no retained snapshot references
    #[instrument(skip(self))]
    pub fn gc(&self) -> Result<GcReport> {
        let _world = self.exclusive()?;
        let graph = self.graph.read();
        GarbageCollector::new(&self.storage, &graph)
            .with_liveness_check(self.config.verify_gc_liveness)
            .collect()
    }

    /// What [`gc`](Self::gc) would delete (dry run)
    #[instrument(skip(self))]
    pub fn gc_analyze(&self) -> Result<GcPlan> {
        let _world = self.shared()?;
        let graph = self.graph.read();
        GarbageCollector::new(&self.storage, &graph)
            .with_liveness_check(self.config.verify_gc_liveness)
            .analyze()
    }

    // ---- verification and sizes ----

    /// Check the integrity of snapshot `id` and the blocks it references
    pub fn verify(&self, id: &str) -> Result<VerificationReport> {
        let graph = self.graph.read();
        let snapshot = graph.resolve_prefix(id)?;
        SnapshotVerifier::new(&self.storage, &graph).verify_snapshot(snapshot)
    }

    /// Check every snapshot
    pub fn verify_all(&self) -> Result<LineageVerificationReport> {
        let graph = self.graph.read();
        SnapshotVerifier::new(&self.storage, &graph).verify_lineage()
    }

    /// Size accounting for snapshot `id`
    pub fn snapshot_size(&self, id: &str) -> Result<SnapshotSize> {
        let graph = self.graph.read();
        let snapshot = graph.resolve_prefix(id)?;
        let resolver = ManifestResolver::new(&graph, &*self.storage);
        let mut size = SnapshotSize {
            layer_bytes: snapshot.layer_bytes(),
            ..SnapshotSize::default()
        };
        for manifest in resolver.resolve_all(&snapshot.id)?.values() {
            size.file_count += manifest.len();
            size.logical_bytes += manifest.values().map(|e| e.size).sum::<u64>();
        }
        Ok(size)
    }

    // ---- scopes ----

    /// Add a scope and persist the configuration
    pub fn add_scope(&self, scope: Scope) -> Result<Scope> {
        let _world = self.exclusive()?;
        let mut manager = self.scopes.write();
        let added = manager.add(scope)?.clone();
        if let Err(e) = self.storage.save_scopes(manager.as_slice()) {
            manager.remove(&added.name)?;
            return Err(e);
        }
        Ok(added)
    }

    /// Remove a scope no snapshot references
    pub fn remove_scope(&self, name: &str) -> Result<Scope> {
        let _world = self.exclusive()?;
        if let Some(&snapshots) = self.graph.read().scopes_in_use().get(name) {
            return Err(StrataError::ScopeInUse {
                name: name.to_string(),
                snapshots,
            });
        }
        let mut manager = self.scopes.write();
        let removed = manager.remove(name)?;
        self.storage.save_scopes(manager.as_slice())?;
        info!("Removed scope '{}'", name);
        Ok(removed)
    }

    /// Configured scopes, in order
    pub fn scopes(&self) -> Vec<Scope> {
        self.scopes.read().iter().cloned().collect()
    }

    // ---- queries ----

    /// All snapshots, oldest first
    pub fn list_snapshots(&self) -> Vec<Snapshot> {
        self.graph.read().snapshots().into_iter().cloned().collect()
    }

    /// A copy of the lineage graph
    pub fn lineage(&self) -> LineageGraph {
        self.graph.read().clone()
    }

    /// Tree view of the lineage
    pub fn tree(&self) -> Option<LineageNode> {
        self.graph.read().tree()
    }

    /// Current head snapshot
    pub fn head(&self) -> Option<Snapshot> {
        self.graph.read().head().cloned()
    }

    /// Snapshot by id or unique id prefix
    pub fn find_snapshot(&self, id: &str) -> Result<Snapshot> {
        self.graph.read().resolve_prefix(id).cloned()
    }

    /// Resolved manifest of `scope` at snapshot `id`
    pub fn resolve(&self, id: &str, scope: &str) -> Result<Manifest> {
        let graph = self.graph.read();
        let target = graph.resolve_prefix(id)?.id.clone();
        ManifestResolver::new(&graph, &*self.storage).resolve(&target, scope)
    }

    /// Content store statistics
    pub fn store_stats(&self) -> Result<StoreStats> {
        self.storage.store().stats()
    }

    /// Engine configuration
    pub fn config(&self) -> &StrataConfig {
        &self.config
    }

    /// Storage directory
    pub fn storage_path(&self) -> &Path {
        self.storage.root()
    }
}

/// Layers a child gets when its parent is pruned
fn reparent_layers(pruned: &SnapshotLayers, child: &SnapshotLayers, becomes_root: bool) -> SnapshotLayers {
    let mut folded = SnapshotLayers::new(child.snapshot_id.clone());
    let names: BTreeSet<&String> = pruned.scopes.keys().chain(child.scopes.keys()).collect();
    for name in names {
        let layer = match (pruned.scopes.get(name), child.scopes.get(name)) {
            (Some(lower), Some(upper)) => fold_layers(lower, upper),
            (Some(lower), None) => lower.clone(),
            (None, Some(upper)) => upper.clone(),
            (None, None) => Layer::delta(),
        };
        let layer = if becomes_root { into_root_layer(layer) } else { layer };
        folded.scopes.insert(name.clone(), layer);
    }
    folded
}

fn prepare_storage_dir(path: &Path) -> Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    fs::create_dir_all(&absolute)?;
    Ok(fs::canonicalize(&absolute)?)
}

/// Builder for [`Strata`] instances
///
/// Settings other than scopes only apply when a new store is initialized;
/// an existing store keeps the configuration it was created with.
///
/// # Examples
///
/// ```rust,no_run
/// use strata::{CompressionStrategy, MetadataFidelity, StrataBuilder};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let strata = StrataBuilder::new()
///     .scope_with_exclusions("game", "/games/skyrim", ["logs/", "*.tmp"])
///     .compression_strategy(CompressionStrategy::Fast)
///     .fidelity(MetadataFidelity::Rewrite)
///     .full_manifest_interval(Some(16))
///     .protect("game/saves/**")
///     .build("/games/.strata")?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct StrataBuilder {
    scopes: Vec<Scope>,
    compression_strategy: CompressionStrategy,
    parallel_workers: usize,
    fidelity: MetadataFidelity,
    full_manifest_interval: Option<usize>,
    protected_patterns: Vec<String>,
    ignore_junk_files: bool,
    verify_gc_liveness: bool,
}

impl Default for StrataBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StrataBuilder {
    /// Builder with default settings
    pub fn new() -> Self {
        Self {
            scopes: Vec::new(),
            compression_strategy: CompressionStrategy::default(),
            parallel_workers: num_cpus::get(),
            fidelity: MetadataFidelity::default(),
            full_manifest_interval: None,
            protected_patterns: Vec::new(),
            ignore_junk_files: true,
            verify_gc_liveness: true,
        }
    }

    /// Track `path` under `name`
    pub fn scope(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.scopes.push(Scope::new(name, path));
        self
    }

    /// Track `path` under `name`, skipping paths matching `exclusions`
    pub fn scope_with_exclusions<I, S>(mut self, name: impl Into<String>, path: impl Into<PathBuf>, exclusions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes.push(Scope::new(name, path).with_exclusions(exclusions));
        self
    }

    /// Set compression strategy
    pub fn compression_strategy(mut self, strategy: CompressionStrategy) -> Self {
        self.compression_strategy = strategy;
        self
    }

    /// Set number of parallel workers (minimum 1)
    pub fn parallel_workers(mut self, count: usize) -> Self {
        self.parallel_workers = count.max(1);
        self
    }

    /// How closely restores reproduce metadata
    pub fn fidelity(mut self, fidelity: MetadataFidelity) -> Self {
        self.fidelity = fidelity;
        self
    }

    /// Store full layers every `interval` generations
    pub fn full_manifest_interval(mut self, interval: Option<usize>) -> Self {
        self.full_manifest_interval = interval;
        self
    }

    /// Never delete paths matching `pattern` during restore
    pub fn protect(mut self, pattern: impl Into<String>) -> Self {
        self.protected_patterns.push(pattern.into());
        self
    }

    /// Skip desktop junk files while scanning
    pub fn ignore_junk_files(mut self, ignore: bool) -> Self {
        self.ignore_junk_files = ignore;
        self
    }

    /// Cross-check gc candidates against resolved manifests
    pub fn verify_gc_liveness(mut self, verify: bool) -> Self {
        self.verify_gc_liveness = verify;
        self
    }

    /// Open the store at `storage_path`, or initialize it if there is none
    ///
    /// Scopes already configured under the same name and path are kept;
    /// new ones are validated and added.
    pub fn build(self, storage_path: impl AsRef<Path>) -> Result<Strata> {
        let storage_path = storage_path.as_ref();
        let strata = if Storage::exists(storage_path) {
            Strata::open(storage_path)?
        } else {
            let mut config = StrataConfig::new(storage_path.to_path_buf());
            config.compression = self.compression_strategy;
            config.parallel_workers = self.parallel_workers;
            config.fidelity = self.fidelity;
            config.full_manifest_interval = self.full_manifest_interval;
            config.protected_patterns = self.protected_patterns;
            config.ignore_junk_files = self.ignore_junk_files;
            config.verify_gc_liveness = self.verify_gc_liveness;
            Strata::init(storage_path, config)?
        };

        for scope in self.scopes {
            let existing = strata.scopes.read().get(&scope.name).cloned();
            match existing {
                Some(existing) => {
                    let same_path = fs::canonicalize(&scope.path).map(|p| p == existing.path).unwrap_or(false);
                    if !same_path {
                        return Err(StrataError::DuplicateScope(scope.name));
                    }
                }
                None => {
                    strata.add_scope(scope)?;
                }
            }
        }
        Ok(strata)
    }
}
