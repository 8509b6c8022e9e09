//! Scope scanning and change detection
//!
//! A scan walks one scope root, fingerprints every regular file and symlink
//! and classifies the result against an optional baseline manifest.
//!
//! ## Fingerprints
//!
//! For each path the scanner records size, modification time (nanosecond
//! precision where the platform has it), permission bits and a SHA-256 of the
//! content. Symlinks are never followed: their target string is the content.
//!
//! When the baseline has an entry for the path with identical size and
//! modification time, its hash is reused without reading the file. With no
//! baseline every file is hashed. Files modified within [`RACY_WINDOW_SECS`] of
//! the scan are always hashed: a rewrite inside one timestamp tick keeps both
//! size and mtime.
//!
//! ## Errors
//!
//! Unreadable paths do not abort the scan. Each becomes a [`ScanIssue`] and
//! the change set is marked partial. A path that was in the baseline but
//! cannot be read now keeps its baseline entry, so a partial commit never
//! records a deletion it did not observe.
//!
//! ## Determinism
//!
//! Discovery and hashing run in parallel, but results are collected into an
//! ordered map, so the output does not depend on worker count or scheduling.

use crate::error::{Result, StrataError};
use crate::scope::Scope;
use crate::types::{ChangeSet, EntryKind, FileEntry, Manifest, ProgressCallback, ProgressInfo, ScanIssue};
use crate::utils;
use ignore::overrides::{Override, OverrideBuilder};
use ignore::{WalkBuilder, WalkState};
use parking_lot::Mutex;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use chrono::{DateTime, Utc};
use std::time::Instant;
use tracing::{debug, instrument, trace, warn};

/// Files modified this many seconds before a scan are rehashed even when size and mtime match
pub const RACY_WINDOW_SECS: i64 = 2;

/// Live state of a scope plus its classification against the baseline
#[derive(Debug, Clone, Default)]
pub struct ScanOutput {
    /// Every tracked path on disk
    pub live: Manifest,
    /// Classification against the baseline
    pub changes: ChangeSet,
}

/// Matches a scope's exclusion globs with gitignore semantics
///
/// A path is excluded when it, or any directory above it, matches.
#[derive(Debug, Clone)]
pub struct ExclusionMatcher {
    overrides: Override,
}

impl ExclusionMatcher {
    /// Compile the exclusions of `scope`
    pub fn new(scope: &Scope) -> Result<Self> {
        Ok(Self {
            overrides: build_overrides(scope)?,
        })
    }

    /// Whether the relative `path` is excluded
    pub fn is_excluded(&self, path: &Path) -> bool {
        if self.overrides.matched(path, false).is_ignore() {
            return true;
        }
        path.ancestors()
            .skip(1)
            .filter(|a| !a.as_os_str().is_empty())
            .any(|dir| self.overrides.matched(dir, true).is_ignore())
    }
}

fn build_overrides(scope: &Scope) -> Result<Override> {
    let mut builder = OverrideBuilder::new(&scope.path);
    for pattern in &scope.exclusions {
        // In override syntax a leading `!` means "ignore"
        builder
            .add(&format!("!{}", pattern))
            .map_err(|e| StrataError::InvalidPattern(format!("{}: {}", pattern, e)))?;
    }
    builder
        .build()
        .map_err(|e| StrataError::InvalidPattern(e.to_string()))
}

/// Directory walker and fingerprinter
#[derive(Debug, Clone)]
pub struct Scanner {
    storage_path: PathBuf,
    parallel_workers: usize,
    ignore_junk_files: bool,
}

impl Scanner {
    /// Create a scanner that never descends into `storage_path`
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: storage_path.into(),
            parallel_workers: num_cpus::get(),
            ignore_junk_files: true,
        }
    }

    /// Set number of parallel workers (minimum 1)
    pub fn with_parallel_workers(mut self, workers: usize) -> Self {
        self.parallel_workers = workers.max(1);
        self
    }

    /// Whether desktop junk files are skipped
    pub fn with_ignore_junk_files(mut self, ignore: bool) -> Self {
        self.ignore_junk_files = ignore;
        self
    }

    /// Scan `scope` and classify it against `baseline`
    #[instrument(skip(self, scope, baseline, progress), fields(scope = %scope.name))]
    pub fn scan(
        &self,
        scope: &Scope,
        baseline: Option<&Manifest>,
        progress: Option<&ProgressCallback>,
    ) -> Result<ScanOutput> {
        let start = Instant::now();
        if !scope.path.is_dir() {
            return Err(StrataError::ScanFailed {
                path: scope.path.clone(),
                reason: "scope root is missing or not a directory".to_string(),
            });
        }

        let (paths, mut issues) = self.discover(scope)?;
        debug!("Discovered {} path(s) in {:?}", paths.len(), start.elapsed());

        let racy_after = Utc::now() - chrono::Duration::seconds(RACY_WINDOW_SECS);
        let processed = AtomicUsize::new(0);
        let total = paths.len();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.parallel_workers)
            .build()?;

        let results: Vec<(PathBuf, std::result::Result<FileEntry, String>)> = pool.install(|| {
            paths
                .par_iter()
                .map(|relative| {
                    let absolute = scope.path.join(relative);
                    let known = baseline.and_then(|b| b.get(relative));
                    let result = fingerprint(&absolute, known, racy_after).map_err(|e| e.to_string());

                    let done = processed.fetch_add(1, Ordering::Relaxed) + 1;
                    if let Some(callback) = progress {
                        callback(ProgressInfo {
                            operation: format!("Scanning {}", scope.name),
                            current_item: Some(utils::slash_path(relative)),
                            processed: done,
                            total: Some(total),
                        });
                    }
                    (relative.clone(), result)
                })
                .collect()
        });

        let mut live = Manifest::new();
        for (relative, result) in results {
            match result {
                Ok(entry) => {
                    live.insert(relative, entry);
                }
                Err(reason) => {
                    warn!("Cannot fingerprint {:?} in scope '{}': {}", relative, scope.name, reason);
                    issues.push(ScanIssue { path: relative, reason });
                }
            }
        }

        issues.sort_by(|a, b| a.path.cmp(&b.path));
        if let Some(baseline) = baseline {
            for issue in &issues {
                if let Some(known) = baseline.get(&issue.path) {
                    live.entry(issue.path.clone()).or_insert_with(|| known.clone());
                }
            }
        }

        let empty = Manifest::new();
        let changes = ChangeSet::between(baseline.unwrap_or(&empty), &live).with_issues(issues);
        debug!(
            "Scanned scope '{}': {} file(s), {} change(s), {} issue(s) in {:?}",
            scope.name,
            live.len(),
            changes.change_count(),
            changes.issues.len(),
            start.elapsed()
        );
        Ok(ScanOutput { live, changes })
    }

    /// Walk the scope, returning relative paths of files and symlinks
    fn discover(&self, scope: &Scope) -> Result<(Vec<PathBuf>, Vec<ScanIssue>)> {
        let overrides = build_overrides(scope)?;
        let mut walker = WalkBuilder::new(&scope.path);
        walker
            .standard_filters(false)
            .hidden(false)
            .follow_links(false)
            .threads(self.parallel_workers)
            .overrides(overrides);

        let storage_path = self.storage_path.clone();
        let ignore_junk = self.ignore_junk_files;
        walker.filter_entry(move |entry| {
            if entry.path() == storage_path {
                return false;
            }
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            !(ignore_junk && !is_dir && utils::is_junk_file(&entry.file_name().to_string_lossy()))
        });

        let found = Arc::new(Mutex::new(Vec::<PathBuf>::new()));
        let issues = Arc::new(Mutex::new(Vec::<ScanIssue>::new()));
        let root = scope.path.clone();

        walker.build_parallel().run(|| {
            let found = Arc::clone(&found);
            let issues = Arc::clone(&issues);
            let root = root.clone();

            Box::new(move |result| {
                match result {
                    Ok(entry) => {
                        let Some(file_type) = entry.file_type() else {
                            return WalkState::Continue;
                        };
                        if file_type.is_dir() {
                            return WalkState::Continue;
                        }
                        if !file_type.is_file() && !file_type.is_symlink() {
                            trace!("Skipping special file {:?}", entry.path());
                            return WalkState::Continue;
                        }
                        if let Ok(relative) = entry.path().strip_prefix(&root) {
                            found.lock().push(relative.to_path_buf());
                        }
                    }
                    Err(err) => {
                        let path = error_path(&err)
                            .map(|p| p.strip_prefix(&root).map(Path::to_path_buf).unwrap_or(p))
                            .unwrap_or_default();
                        warn!("Walk error at {:?}: {}", path, err);
                        issues.lock().push(ScanIssue {
                            path,
                            reason: err.to_string(),
                        });
                    }
                }
                WalkState::Continue
            })
        });

        let mut paths = std::mem::take(&mut *found.lock());
        paths.sort();
        let issues = std::mem::take(&mut *issues.lock());
        Ok((paths, issues))
    }
}

/// Fingerprint one path, reusing `known`'s hash when size and mtime match
fn fingerprint(path: &Path, known: Option<&FileEntry>, racy_after: DateTime<Utc>) -> Result<FileEntry> {
    let meta = utils::get_file_metadata(path)?;

    if meta.is_symlink {
        let target = utils::read_symlink(path)?;
        let content = utils::symlink_content(&target);
        return Ok(FileEntry {
            kind: EntryKind::Symlink { target },
            content_hash: utils::hash_data(&content),
            size: content.len() as u64,
            modified: meta.modified,
            permissions: meta.permissions,
        });
    }

    let reusable = known.filter(|k| {
        k.kind == EntryKind::File && k.size == meta.size && k.modified == meta.modified && meta.modified < racy_after
    });
    let content_hash = match reusable {
        Some(known) => known.content_hash.clone(),
        None => utils::hash_file_content(path)?,
    };

    Ok(FileEntry {
        kind: EntryKind::File,
        content_hash,
        size: meta.size,
        modified: meta.modified,
        permissions: meta.permissions,
    })
}

fn error_path(err: &ignore::Error) -> Option<PathBuf> {
    match err {
        ignore::Error::WithPath { path, .. } => Some(path.clone()),
        ignore::Error::WithDepth { err, .. } | ignore::Error::WithLineNumber { err, .. } => error_path(err),
        ignore::Error::Partial(errs) => errs.iter().find_map(error_path),
        ignore::Error::Loop { child, .. } => Some(child.clone()),
        _ => None,
    }
}
