//! # Strata - Delta-based snapshots for very large directory trees
//!
//! A snapshot engine that captures the state of one or more large directory
//! trees (a game install, its configuration and save folders, ...) and can
//! later make the disk match any captured state exactly.
//!
//! ## Overview
//!
//! Strata keeps a tree of immutable snapshots and lets you:
//! - Snapshot several directory trees ("scopes") together as one world state
//! - Restore every scope to any earlier snapshot, jumping freely between branches
//! - Store each snapshot as a layer of changes against its parent
//! - Store every distinct file content exactly once, however many paths or
//!   snapshots share it
//! - Preview a restore before touching the disk
//! - Prune snapshots from the lineage and reclaim the space they held
//!
//! ## Architecture
//!
//! - **Content Store**: blocks addressed by the SHA-256 of their content,
//!   optionally LZ4 compressed, reference counted per layer entry
//! - **Scanner**: parallel walk that fingerprints a scope, reusing baseline
//!   hashes for files whose size and mtime are unchanged
//! - **Lineage Graph**: single-rooted tree of snapshot headers with a movable head
//! - **Manifest Resolver**: folds layers along the ancestry into the full
//!   state of a scope, starting from the nearest full layer
//! - **Reconciler**: plans and applies the file operations that turn the disk
//!   into a resolved manifest
//! - **Garbage Collector**: deletes blocks no snapshot references
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use strata::StrataBuilder;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let strata = StrataBuilder::new()
//!     .scope("game", "/games/skyrim")
//!     .scope("saves", "/home/me/Documents/My Games/Skyrim")
//!     .build("/games/.strata")?;
//!
//! // Baseline of the untouched install
//! let vanilla = strata.bootstrap()?;
//!
//! // ... install a mod list ...
//! let modded = strata.snapshot("Requiem + textures")?;
//!
//! // Back to vanilla and forth again
//! let report = strata.restore(&vanilla.id)?;
//! println!("deleted {}, wrote {}", report.deleted, report.written);
//! strata.restore(&modded.id)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Pruning and Garbage Collection
//!
//! ```rust,no_run
//! use strata::{PrunePolicy, Strata};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let strata = Strata::open("/games/.strata")?;
//! let old = strata.find_snapshot("3f2a")?;
//!
//! // Drop it but keep its children resolving to the same state
//! strata.prune(&old.id, PrunePolicy::Reparent)?;
//!
//! // See what would be reclaimed, then reclaim it
//! let plan = strata.gc_analyze()?;
//! println!("{} unreferenced blocks", plan.candidates.len());
//! strata.gc()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency
//!
//! Operations that change persisted state hold an exclusive lock over the
//! storage directory for their whole duration. A second process attempting
//! one gets [`StrataError::WorldLocked`] instead of waiting.

#![warn(missing_docs)]
#![warn(clippy::all)]

// Public API modules
pub mod compression;
pub mod engine;
pub mod error;
pub mod gc;
pub mod lineage;
pub mod lock;
pub mod reconcile;
pub mod resolver;
pub mod scanner;
pub mod scope;
pub mod snapshot;
pub mod storage;
pub mod store;
pub mod types;
pub mod verify;

// Internal modules (not part of public API)
mod collections;
mod utils;

// Re-export main types for convenience
pub use compression::{default_skip_extensions, CompressionEngine, CompressionStrategy};
pub use engine::{Strata, StrataBuilder, VANILLA_LABEL};
pub use error::{ErrorKind, Result, StrataError};
pub use gc::{GcPlan, GcReport};
pub use lineage::{LineageGraph, LineageNode, RemovalPlan};
pub use reconcile::{PlanSummary, RestorePlan, RestoreReport, ScopePlan};
pub use scope::Scope;
pub use snapshot::{LayerStats, Snapshot, SnapshotLayers};
pub use storage::Storage;
pub use store::{ContentStore, StoreStats};
pub use types::*;
pub use utils::format_bytes;
pub use verify::{LineageVerificationReport, SnapshotVerifier, VerificationReport};
