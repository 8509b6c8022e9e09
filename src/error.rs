//! Error types for the strata engine
//!
//! Every failure the engine can surface is a variant of [`StrataError`]. The
//! variants are grouped by the component that raises them, and
//! [`StrataError::kind`] maps each one onto the coarse [`ErrorKind`] that
//! callers branch on (scan, content store, lineage, scope configuration and
//! garbage-collection invariant failures).

use std::path::PathBuf;
use thiserror::Error;

use crate::reconcile::RestoreReport;

/// Type alias for Results in the strata library
pub type Result<T> = std::result::Result<T, StrataError>;

/// Coarse classification of a [`StrataError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A scope could not be fully scanned
    Scan,
    /// A block could not be written, read or verified
    ContentStore,
    /// The lineage graph is inconsistent or an id is unknown
    Lineage,
    /// The scope configuration was rejected
    ScopeConfig,
    /// The collector found a live block among its deletion candidates
    GarbageCollectionInvariantViolation,
    /// Plain I/O failure outside the categories above
    Io,
    /// Unexpected internal condition
    Internal,
}

/// Main error type for all strata operations
#[derive(Debug, Error)]
pub enum StrataError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors during bincode serialization/deserialization
    #[error("Bincode error: {0}")]
    Bincode(String),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    // ---- scanner ----
    /// A scan finished with unreadable paths and the caller did not accept a partial result
    #[error("Scan of scope '{scope}' is partial: {issues} path(s) could not be read")]
    PartialScan {
        /// Scope that produced the issues
        scope: String,
        /// Number of unreadable paths
        issues: usize,
    },

    /// A single path could not be fingerprinted
    #[error("Cannot scan {path:?}: {reason}")]
    ScanFailed {
        /// Offending path
        path: PathBuf,
        /// Underlying reason
        reason: String,
    },

    // ---- content store ----
    /// Block not found in the content store
    #[error("Block not found: {0}")]
    BlockNotFound(String),

    /// Block bytes do not match their address
    #[error("Hash mismatch - expected: {expected}, actual: {actual}")]
    HashMismatch {
        /// Expected hash value
        expected: String,
        /// Actual computed hash value
        actual: String,
    },

    /// Block file is unreadable or has an unknown layout
    #[error("Corrupt block {hash}: {reason}")]
    CorruptBlock {
        /// Address of the block
        hash: String,
        /// What was wrong with it
        reason: String,
    },

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Storage is not initialized
    #[error("Storage not initialized at path: {0:?}")]
    StorageNotInitialized(PathBuf),

    /// Storage already exists
    #[error("Storage already exists at path: {0:?}")]
    StorageAlreadyExists(PathBuf),

    /// Another process holds the world lock
    #[error("Storage at {0:?} is locked by another operation")]
    WorldLocked(PathBuf),

    // ---- lineage ----
    /// Snapshot id is unknown
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// Snapshot id prefix matches more than one snapshot
    #[error("Snapshot id '{prefix}' is ambiguous ({matches} matches)")]
    AmbiguousSnapshotId {
        /// The prefix that was given
        prefix: String,
        /// Number of matching snapshots
        matches: usize,
    },

    /// A snapshot points at a parent that does not exist
    #[error("Snapshot {id} references missing parent {parent}")]
    MissingParent {
        /// Child snapshot
        id: String,
        /// Parent id that could not be found
        parent: String,
    },

    /// Cycle in the parent chain
    #[error("Cyclic lineage detected at snapshot {0}")]
    CycleDetected(String),

    /// A second parentless snapshot was offered
    #[error("Lineage already has a root snapshot ({0})")]
    RootAlreadyExists(String),

    /// Snapshot has children and the prune policy forbids removing it
    #[error("Cannot prune snapshot {id}: it has {children} child snapshot(s)")]
    SnapshotHasChildren {
        /// Snapshot that was asked to be pruned
        id: String,
        /// Number of direct children
        children: usize,
    },

    /// Stored snapshot data does not match its recorded state hash
    #[error("Snapshot {id} failed integrity check: {reason}")]
    InvalidSnapshot {
        /// Snapshot id
        id: String,
        /// What failed
        reason: String,
    },

    /// A manifest could not be resolved
    #[error("Cannot resolve snapshot {id} for scope '{scope}': {reason}")]
    UnresolvableManifest {
        /// Snapshot id
        id: String,
        /// Scope name
        scope: String,
        /// Underlying reason
        reason: String,
    },

    /// Operation needs a head snapshot but the lineage is empty
    #[error("No snapshot has been created yet")]
    EmptyLineage,

    // ---- scope configuration ----
    /// Two scopes share a name
    #[error("Duplicate scope name: {0}")]
    DuplicateScope(String),

    /// Scope name is not usable as an identifier
    #[error("Invalid scope name '{0}'")]
    InvalidScopeName(String),

    /// Scope path is missing, relative or otherwise unusable
    #[error("Invalid path for scope '{name}': {path:?} ({reason})")]
    InvalidScopePath {
        /// Scope name
        name: String,
        /// Offending path
        path: PathBuf,
        /// Why it was rejected
        reason: String,
    },

    /// Two scope paths nest inside each other
    #[error("Scope '{first}' ({first_path:?}) overlaps scope '{second}' ({second_path:?})")]
    OverlappingScopes {
        /// First scope name
        first: String,
        /// First scope path
        first_path: PathBuf,
        /// Second scope name
        second: String,
        /// Second scope path
        second_path: PathBuf,
    },

    /// Scope is not configured
    #[error("Unknown scope: {0}")]
    UnknownScope(String),

    /// Scope is still referenced by snapshots and cannot be removed
    #[error("Scope '{name}' is referenced by {snapshots} snapshot(s)")]
    ScopeInUse {
        /// Scope name
        name: String,
        /// Number of referencing snapshots
        snapshots: usize,
    },

    /// Pattern parsing error
    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    // ---- garbage collection ----
    /// A block selected for deletion turned out to be live
    #[error("Garbage collection aborted: block {hash} is still referenced by snapshot {snapshot}")]
    GcInvariantViolation {
        /// Block address
        hash: String,
        /// A retained snapshot that reaches it
        snapshot: String,
    },

    // ---- reconcile ----
    /// Restore stopped part-way; completed steps stay applied
    #[error("Restore aborted after {} of {} step(s): {source}", .report.completed_steps(), .report.planned_steps())]
    RestoreAborted {
        /// What was done before the failure
        report: Box<RestoreReport>,
        /// Why it stopped
        #[source]
        source: Box<StrataError>,
    },

    /// Operation was cancelled through its cancel token
    #[error("Operation cancelled")]
    Cancelled,

    /// Thread pool error
    #[error("Thread pool error: {0}")]
    ThreadPool(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

// Implement conversions for bincode 2.0 error types
impl From<bincode::error::DecodeError> for StrataError {
    fn from(err: bincode::error::DecodeError) -> Self {
        StrataError::Bincode(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for StrataError {
    fn from(err: bincode::error::EncodeError) -> Self {
        StrataError::Bincode(err.to_string())
    }
}

impl From<globset::Error> for StrataError {
    fn from(err: globset::Error) -> Self {
        StrataError::InvalidPattern(err.to_string())
    }
}

impl From<rayon::ThreadPoolBuildError> for StrataError {
    fn from(err: rayon::ThreadPoolBuildError) -> Self {
        StrataError::ThreadPool(err.to_string())
    }
}

impl StrataError {
    /// Create a storage error with a custom message
    pub fn storage(msg: impl Into<String>) -> Self {
        StrataError::Storage(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        StrataError::Internal(msg.into())
    }

    /// Create a corrupt-block error
    pub fn corrupt(hash: impl Into<String>, reason: impl Into<String>) -> Self {
        StrataError::CorruptBlock {
            hash: hash.into(),
            reason: reason.into(),
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            StrataError::PartialScan { .. } | StrataError::ScanFailed { .. } | StrataError::WalkDir(_) => {
                ErrorKind::Scan
            }
            StrataError::BlockNotFound(_)
            | StrataError::HashMismatch { .. }
            | StrataError::CorruptBlock { .. }
            | StrataError::Storage(_)
            | StrataError::StorageNotInitialized(_)
            | StrataError::StorageAlreadyExists(_)
            | StrataError::WorldLocked(_)
            | StrataError::Bincode(_) => ErrorKind::ContentStore,
            StrataError::SnapshotNotFound(_)
            | StrataError::AmbiguousSnapshotId { .. }
            | StrataError::MissingParent { .. }
            | StrataError::CycleDetected(_)
            | StrataError::RootAlreadyExists(_)
            | StrataError::SnapshotHasChildren { .. }
            | StrataError::InvalidSnapshot { .. }
            | StrataError::UnresolvableManifest { .. }
            | StrataError::EmptyLineage => ErrorKind::Lineage,
            StrataError::DuplicateScope(_)
            | StrataError::InvalidScopeName(_)
            | StrataError::InvalidScopePath { .. }
            | StrataError::OverlappingScopes { .. }
            | StrataError::UnknownScope(_)
            | StrataError::ScopeInUse { .. }
            | StrataError::InvalidPattern(_)
            | StrataError::InvalidConfiguration(_) => ErrorKind::ScopeConfig,
            StrataError::GcInvariantViolation { .. } => ErrorKind::GarbageCollectionInvariantViolation,
            StrataError::RestoreAborted { source, .. } => source.kind(),
            StrataError::Io(_) | StrataError::Json(_) => ErrorKind::Io,
            StrataError::Cancelled | StrataError::ThreadPool(_) | StrataError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Check if re-running the same operation can succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            StrataError::WorldLocked(_) | StrataError::Cancelled | StrataError::PartialScan { .. } => true,
            StrataError::RestoreAborted { source, .. } => {
                source.is_recoverable() || matches!(**source, StrataError::Io(_))
            }
            _ => false,
        }
    }

    /// Check if this error indicates corruption
    pub fn is_corruption(&self) -> bool {
        match self {
            StrataError::HashMismatch { .. }
            | StrataError::CorruptBlock { .. }
            | StrataError::InvalidSnapshot { .. }
            | StrataError::CycleDetected(_)
            | StrataError::MissingParent { .. } => true,
            StrataError::RestoreAborted { source, .. } => source.is_corruption(),
            _ => false,
        }
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            StrataError::SnapshotNotFound(id) => {
                format!("Snapshot '{}' not found. Run 'strata list' to see available snapshots.", id)
            }
            StrataError::PartialScan { scope, issues } => {
                format!(
                    "{} path(s) in scope '{}' could not be read. Fix permissions or pass --allow-partial to accept an incomplete snapshot.",
                    issues, scope
                )
            }
            StrataError::SnapshotHasChildren { id, children } => {
                format!(
                    "Snapshot '{}' has {} child snapshot(s). Pass --policy reparent to attach them to its parent or --policy cascade to prune them too.",
                    id, children
                )
            }
            StrataError::StorageNotInitialized(path) => {
                format!("Storage not initialized at {:?}. Run 'strata init' first.", path)
            }
            StrataError::WorldLocked(path) => {
                format!("Another strata operation holds the lock at {:?}. Try again once it finishes.", path)
            }
            StrataError::RestoreAborted { report, source } => {
                format!(
                    "Restore stopped after {} of {} step(s): {}. Run the same restore again to finish it.",
                    report.completed_steps(),
                    report.planned_steps(),
                    source.user_message()
                )
            }
            _ => self.to_string(),
        }
    }
}
