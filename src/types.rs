//! Core data types used throughout the strata library
//!
//! ## Overview
//!
//! The types in this module represent:
//! - **File state**: [`FileEntry`], [`EntryKind`], [`LayerEntry`], [`Layer`] and [`Manifest`]
//! - **Scan results**: [`ChangeSet`] and [`ScanIssue`]
//! - **Configuration**: [`StrataConfig`], [`MetadataFidelity`], [`PrunePolicy`]
//! - **Operation parameters**: [`SnapshotOptions`], [`RestoreOptions`], [`CancelToken`]
//! - **Reports**: [`PruneReport`], [`SnapshotSize`]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::compression::CompressionStrategy;

/// What kind of filesystem object an entry describes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// Regular file; content lives in the block named by `content_hash`
    File,
    /// Symbolic link stored as an opaque leaf. The target string is its content.
    Symlink {
        /// Link target exactly as read from disk
        target: PathBuf,
    },
}

/// State of one tracked path inside a scope
///
/// Entries are keyed by their path relative to the scope root, so the path
/// itself is not repeated here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileEntry {
    /// File or symlink
    pub kind: EntryKind,
    /// SHA-256 of the content (file bytes, or link target bytes)
    pub content_hash: String,
    /// Content size in bytes
    pub size: u64,
    /// Last modification time, nanosecond precision where the platform has it
    pub modified: DateTime<Utc>,
    /// Permission bits (unix mode, or 0o444/0o644 for read-only/writable on windows)
    pub permissions: u32,
}

impl FileEntry {
    /// Whether this entry is a symbolic link
    pub fn is_symlink(&self) -> bool {
        matches!(self.kind, EntryKind::Symlink { .. })
    }

    /// Same content (and kind), regardless of metadata
    pub fn same_content(&self, other: &FileEntry) -> bool {
        self.content_hash == other.content_hash && self.kind == other.kind
    }

    /// Same metadata that a restore is able to reproduce
    pub fn same_metadata(&self, other: &FileEntry) -> bool {
        if self.is_symlink() {
            // Link metadata is not portable; the target is all that matters.
            return true;
        }
        self.permissions == other.permissions && self.modified == other.modified
    }
}

/// One path in a layer: either a live entry or a deletion marker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum LayerEntry {
    /// Path exists with this state
    Present(FileEntry),
    /// Path was deleted relative to the parent snapshot
    Tombstone,
}

impl LayerEntry {
    /// The live entry, if not a tombstone
    pub fn as_present(&self) -> Option<&FileEntry> {
        match self {
            LayerEntry::Present(entry) => Some(entry),
            LayerEntry::Tombstone => None,
        }
    }
}

/// A snapshot's contribution to one scope
///
/// A delta layer only lists paths that changed relative to the parent. A full
/// layer lists every live path, plus tombstones for anything the parent had,
/// so that merging it as a delta or starting resolution from it yield the same
/// state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Layer {
    /// Whether this layer can serve as a resolution base
    pub full: bool,
    /// Changed paths, relative to the scope root
    pub entries: BTreeMap<PathBuf, LayerEntry>,
}

impl Layer {
    /// Empty delta layer
    pub fn delta() -> Self {
        Self::default()
    }

    /// Number of present entries
    pub fn present_count(&self) -> usize {
        self.entries.values().filter(|e| e.as_present().is_some()).count()
    }

    /// Number of tombstones
    pub fn tombstone_count(&self) -> usize {
        self.entries.len() - self.present_count()
    }

    /// Sum of content sizes of present entries
    pub fn present_bytes(&self) -> u64 {
        self.entries.values().filter_map(LayerEntry::as_present).map(|e| e.size).sum()
    }

    /// Content hashes referenced by this layer, one per present entry
    pub fn referenced_hashes(&self) -> impl Iterator<Item = &str> {
        self.entries
            .values()
            .filter_map(LayerEntry::as_present)
            .map(|e| e.content_hash.as_str())
    }
}

/// Fully resolved state of a scope: relative path to live entry
pub type Manifest = BTreeMap<PathBuf, FileEntry>;

/// A path that could not be scanned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanIssue {
    /// Path relative to the scope root (or absolute when outside of it)
    pub path: PathBuf,
    /// Error description
    pub reason: String,
}

/// Classification of a scope's live state against a baseline manifest
///
/// `metadata_only` is a subset of `unchanged`: same content, different
/// permissions or modification time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// On disk, not in the baseline
    pub added: BTreeSet<PathBuf>,
    /// In both, content differs
    pub modified: BTreeSet<PathBuf>,
    /// In the baseline, not on disk
    pub removed: BTreeSet<PathBuf>,
    /// In both, content identical
    pub unchanged: BTreeSet<PathBuf>,
    /// Unchanged paths whose metadata differs
    pub metadata_only: BTreeSet<PathBuf>,
    /// Whether some paths could not be read
    pub partial: bool,
    /// The unreadable paths
    pub issues: Vec<ScanIssue>,
}

impl ChangeSet {
    /// Classify `live` against `baseline`
    pub fn between(baseline: &Manifest, live: &Manifest) -> Self {
        let mut changes = ChangeSet::default();

        for (path, entry) in live {
            match baseline.get(path) {
                None => {
                    changes.added.insert(path.clone());
                }
                Some(base) if !base.same_content(entry) => {
                    changes.modified.insert(path.clone());
                }
                Some(base) => {
                    if !base.same_metadata(entry) {
                        changes.metadata_only.insert(path.clone());
                    }
                    changes.unchanged.insert(path.clone());
                }
            }
        }

        for path in baseline.keys() {
            if !live.contains_key(path) {
                changes.removed.insert(path.clone());
            }
        }

        changes
    }

    /// Record unreadable paths and mark the set partial
    pub fn with_issues(mut self, issues: Vec<ScanIssue>) -> Self {
        self.partial = !issues.is_empty();
        self.issues = issues;
        self
    }

    /// Whether anything differs (metadata-only differences count)
    pub fn has_changes(&self) -> bool {
        !self.added.is_empty()
            || !self.modified.is_empty()
            || !self.removed.is_empty()
            || !self.metadata_only.is_empty()
    }

    /// Number of changed paths
    pub fn change_count(&self) -> usize {
        self.added.len() + self.modified.len() + self.removed.len() + self.metadata_only.len()
    }

    /// Merge another scope's change set, prefixing its paths with the scope name
    pub fn absorb(&mut self, scope: &str, other: ChangeSet) {
        let prefix = |p: PathBuf| PathBuf::from(scope).join(p);
        self.added.extend(other.added.into_iter().map(prefix));
        self.modified.extend(other.modified.into_iter().map(prefix));
        self.removed.extend(other.removed.into_iter().map(prefix));
        self.unchanged.extend(other.unchanged.into_iter().map(prefix));
        self.metadata_only.extend(other.metadata_only.into_iter().map(prefix));
        self.partial |= other.partial;
        self.issues.extend(other.issues.into_iter().map(|mut issue| {
            issue.path = prefix(issue.path);
            issue
        }));
    }
}

/// How closely a restore reproduces file metadata
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetadataFidelity {
    /// Only content is compared; metadata-only differences are left alone
    ContentOnly,
    /// Metadata-only differences are fixed in place
    #[default]
    InPlace,
    /// Metadata-only differences cause the file to be rewritten
    Rewrite,
}

/// What to do with the children of a pruned snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrunePolicy {
    /// Refuse to prune a snapshot that has children
    #[default]
    Reject,
    /// Attach children to the pruned snapshot's parent, folding its layers into theirs
    Reparent,
    /// Prune the snapshot and every descendant
    Cascade,
}

/// Engine configuration, persisted in the storage metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrataConfig {
    /// Directory holding blocks, manifests and lineage metadata
    pub storage_path: PathBuf,
    /// Worker threads for hashing, ingestion and restore writes
    pub parallel_workers: usize,
    /// Block compression strategy
    pub compression: CompressionStrategy,
    /// Restore metadata fidelity
    pub fidelity: MetadataFidelity,
    /// Store a full layer every N generations (root is always full)
    pub full_manifest_interval: Option<usize>,
    /// Globs (matched as `scope/relative` and `relative`) that restore never deletes
    pub protected_patterns: Vec<String>,
    /// Skip desktop junk files (`thumbs.db`, `.ds_store`, `desktop.ini`)
    pub ignore_junk_files: bool,
    /// Cross-check gc candidates against fully resolved manifests
    pub verify_gc_liveness: bool,
    /// Configuration format version
    pub version: String,
}

impl StrataConfig {
    /// Default configuration for a store at `storage_path`
    pub fn new(storage_path: PathBuf) -> Self {
        Self {
            storage_path,
            parallel_workers: num_cpus::get(),
            compression: CompressionStrategy::default(),
            fidelity: MetadataFidelity::default(),
            full_manifest_interval: None,
            protected_patterns: Vec::new(),
            ignore_junk_files: true,
            verify_gc_liveness: true,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Storage metadata written at init time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageMetadata {
    /// On-disk format version
    pub format_version: u32,
    /// Crate version that created the store
    pub strata_version: String,
    /// When the store was created
    pub created_at: DateTime<Utc>,
    /// Last time it was opened
    pub last_accessed: DateTime<Utc>,
    /// Engine configuration
    pub config: StrataConfig,
}

/// Persisted head pointer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeadState {
    /// Current head snapshot
    pub head: Option<String>,
    /// Format version for future compatibility
    pub version: u32,
}

/// Progress callback for long-running operations
pub type ProgressCallback = Arc<dyn Fn(ProgressInfo) + Send + Sync>;

/// Information passed to progress callbacks
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// Operation being performed
    pub operation: String,
    /// Current item being processed
    pub current_item: Option<String>,
    /// Items processed so far
    pub processed: usize,
    /// Total items to process (if known)
    pub total: Option<usize>,
}

impl ProgressInfo {
    /// Get progress as a percentage (0-100)
    pub fn percentage(&self) -> Option<f32> {
        match self.total {
            Some(total) if total > 0 => Some((self.processed as f32 / total as f32) * 100.0),
            _ => None,
        }
    }
}

/// Cooperative cancellation flag
///
/// Checked before each plan step; cancelling stops further steps but never
/// undoes completed ones.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// New, not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Options for snapshot creation
#[derive(Clone, Default)]
pub struct SnapshotOptions {
    /// Human label
    pub label: String,
    /// Restrict the snapshot to these scopes; others inherit their parent state
    pub scopes: Option<Vec<String>>,
    /// Accept a scan that could not read every path
    pub allow_partial: bool,
    /// Progress callback
    pub progress_callback: Option<ProgressCallback>,
}

impl SnapshotOptions {
    /// Options with just a label
    pub fn labeled(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Default::default()
        }
    }
}

impl std::fmt::Debug for SnapshotOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotOptions")
            .field("label", &self.label)
            .field("scopes", &self.scopes)
            .field("allow_partial", &self.allow_partial)
            .field("progress_callback", &self.progress_callback.is_some())
            .finish()
    }
}

/// Options for restore operations
#[derive(Clone, Default)]
pub struct RestoreOptions {
    /// Proceed even if the live scan could not read every path
    pub allow_partial: bool,
    /// Reuse target hashes for live files with matching size and mtime
    /// instead of rehashing everything
    pub trust_mtime: bool,
    /// Stop issuing plan steps once cancelled
    pub cancel: Option<CancelToken>,
    /// Progress callback
    pub progress_callback: Option<ProgressCallback>,
}

impl std::fmt::Debug for RestoreOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestoreOptions")
            .field("allow_partial", &self.allow_partial)
            .field("trust_mtime", &self.trust_mtime)
            .field("cancel", &self.cancel.is_some())
            .field("progress_callback", &self.progress_callback.is_some())
            .finish()
    }
}

/// Outcome of a prune
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PruneReport {
    /// Snapshots removed from the lineage
    pub removed: Vec<String>,
    /// Children attached to a new parent
    pub reparented: Vec<String>,
    /// Block references released
    pub references_released: usize,
    /// Blocks whose refcount dropped to zero
    pub blocks_now_unreferenced: usize,
    /// Stored bytes those blocks occupy, reclaimable by gc
    pub bytes_reclaimable: u64,
    /// New head, if the old one was removed
    pub new_head: Option<String>,
}

/// Size accounting for one snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSize {
    /// Total content size of the resolved state across scopes
    pub logical_bytes: u64,
    /// Content size of the entries stored in this snapshot's own layers
    pub layer_bytes: u64,
    /// Number of live files across scopes
    pub file_count: usize,
}
