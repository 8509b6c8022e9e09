//! Destructive restore: plan, then wipe and rebuild
//!
//! A restore never edits files in place. For every scope it compares the
//! resolved target manifest with a fresh scan of the disk and produces a
//! [`ScopePlan`]:
//!
//! - `to_delete`: on disk, not in the target
//! - `to_write`: in the target, missing on disk or with different content
//! - `to_touch`: same content, different permissions or modification time
//!
//! Execution runs deletions first (deepest paths first), then removes
//! directories left empty, then writes, then touches. Every write streams the
//! block into a temporary file in the destination directory, applies
//! metadata, fsyncs and renames over the final path, so a half-written file is
//! never visible under its real name.
//!
//! There is no rollback. If a step fails, or the cancel token fires, the
//! remaining steps are not issued and [`StrataError::RestoreAborted`] carries
//! a [`RestoreReport`] of what was done. Re-running the same restore
//! recomputes the plan from the disk and finishes the job.

use crate::error::{Result, StrataError};
use crate::scanner::ExclusionMatcher;
use crate::scope::{compile_patterns, Scope};
use crate::store::ContentStore;
use crate::types::{CancelToken, EntryKind, FileEntry, Manifest, MetadataFidelity, ProgressCallback, ProgressInfo, StrataConfig};
use crate::utils::{self, format_bytes, IO_BUFFER_SIZE};
use globset::GlobSet;
use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument, trace, warn};

/// Restore steps for one scope
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopePlan {
    /// Scope name
    pub scope: String,
    /// Scope root on disk
    pub root: PathBuf,
    /// Paths to delete with their on-disk size, deepest first
    pub to_delete: Vec<(PathBuf, u64)>,
    /// Paths to (re)write from the store
    pub to_write: BTreeMap<PathBuf, FileEntry>,
    /// Paths whose metadata is fixed in place
    pub to_touch: BTreeMap<PathBuf, FileEntry>,
    /// Extraneous paths left alone because they are protected
    pub protected: Vec<PathBuf>,
    /// Junk-named paths the target tracks; directory cleanup keeps them
    pub tracked_junk: BTreeSet<PathBuf>,
}

impl ScopePlan {
    /// Number of file-level steps
    pub fn step_count(&self) -> usize {
        self.to_delete.len() + self.to_write.len() + self.to_touch.len()
    }

    /// Whether nothing needs to change
    pub fn is_empty(&self) -> bool {
        self.step_count() == 0
    }
}

/// A complete restore plan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestorePlan {
    /// Target snapshot
    pub target: String,
    /// Per-scope steps, in configuration order
    pub scopes: Vec<ScopePlan>,
    /// Configured scopes the target has no history for; left untouched
    pub skipped_scopes: Vec<String>,
}

impl RestorePlan {
    /// Counts and byte totals
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary {
            scopes: self.scopes.len(),
            skipped_scopes: self.skipped_scopes.len(),
            ..PlanSummary::default()
        };
        for plan in &self.scopes {
            summary.files_to_delete += plan.to_delete.len();
            summary.bytes_to_delete += plan.to_delete.iter().map(|(_, size)| size).sum::<u64>();
            summary.files_to_write += plan.to_write.len();
            summary.bytes_to_write += plan.to_write.values().map(|e| e.size).sum::<u64>();
            summary.files_to_touch += plan.to_touch.len();
            summary.protected += plan.protected.len();
        }
        summary
    }

    /// Whether no scope needs any change
    pub fn is_empty(&self) -> bool {
        self.scopes.iter().all(ScopePlan::is_empty)
    }
}

/// What a restore will do, in numbers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanSummary {
    /// Files to delete
    pub files_to_delete: usize,
    /// Bytes those files occupy
    pub bytes_to_delete: u64,
    /// Files to write
    pub files_to_write: usize,
    /// Bytes to write
    pub bytes_to_write: u64,
    /// Files to touch
    pub files_to_touch: usize,
    /// Extraneous files kept because they are protected
    pub protected: usize,
    /// Scopes restored
    pub scopes: usize,
    /// Scopes skipped for lack of history
    pub skipped_scopes: usize,
}

impl PlanSummary {
    /// Total file-level steps
    pub fn total_steps(&self) -> usize {
        self.files_to_delete + self.files_to_write + self.files_to_touch
    }
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "delete {} file(s) ({}), write {} file(s) ({}), touch {} file(s) across {} scope(s)",
            self.files_to_delete,
            format_bytes(self.bytes_to_delete),
            self.files_to_write,
            format_bytes(self.bytes_to_write),
            self.files_to_touch,
            self.scopes
        )?;
        if self.skipped_scopes > 0 {
            write!(f, ", {} scope(s) skipped", self.skipped_scopes)?;
        }
        if self.protected > 0 {
            write!(f, ", {} protected file(s) kept", self.protected)?;
        }
        Ok(())
    }
}

/// What a restore did
#[derive(Debug, Clone, Default)]
pub struct RestoreReport {
    /// Target snapshot
    pub target: String,
    /// The plan that was executed
    pub summary: PlanSummary,
    /// Files deleted
    pub deleted: usize,
    /// Directories removed after deletions
    pub directories_removed: usize,
    /// Files written
    pub written: usize,
    /// Bytes written
    pub bytes_written: u64,
    /// Files touched
    pub touched: usize,
    /// Scopes skipped for lack of history
    pub skipped_scopes: Vec<String>,
    /// Whether execution stopped on the cancel token
    pub cancelled: bool,
    /// Wall time of the execution
    pub duration: Duration,
}

impl RestoreReport {
    /// File-level steps completed
    pub fn completed_steps(&self) -> usize {
        self.deleted + self.written + self.touched
    }

    /// File-level steps planned
    pub fn planned_steps(&self) -> usize {
        self.summary.total_steps()
    }
}

/// Plans and executes restores against the content store
pub struct Reconciler<'a> {
    store: &'a ContentStore,
    fidelity: MetadataFidelity,
    protected: GlobSet,
    storage_path: PathBuf,
    parallel_workers: usize,
    strip_junk: bool,
}

impl<'a> Reconciler<'a> {
    /// Reconciler using the restore settings of `config`
    pub fn new(store: &'a ContentStore, config: &StrataConfig) -> Result<Self> {
        Ok(Self {
            store,
            fidelity: config.fidelity,
            protected: compile_patterns(&config.protected_patterns)?,
            storage_path: fs::canonicalize(&config.storage_path).unwrap_or_else(|_| config.storage_path.clone()),
            parallel_workers: config.parallel_workers.max(1),
            strip_junk: config.ignore_junk_files,
        })
    }

    /// Whether `relative` in `scope` must never be deleted
    pub fn is_protected(&self, scope: &Scope, relative: &Path) -> bool {
        if scope.path.join(relative).starts_with(&self.storage_path) {
            return true;
        }
        let slashed = utils::slash_path(relative);
        self.protected.is_match(&slashed) || self.protected.is_match(format!("{}/{}", scope.name, slashed))
    }

    /// Steps that turn `live` into `target` for one scope
    pub fn plan_scope(&self, scope: &Scope, target: &Manifest, live: &Manifest) -> Result<ScopePlan> {
        let exclusions = ExclusionMatcher::new(scope)?;
        let mut plan = ScopePlan {
            scope: scope.name.clone(),
            root: scope.path.clone(),
            ..ScopePlan::default()
        };

        for (path, entry) in live {
            if target.contains_key(path) {
                continue;
            }
            if self.is_protected(scope, path) {
                plan.protected.push(path.clone());
            } else {
                plan.to_delete.push((path.clone(), entry.size));
            }
        }
        plan.to_delete.sort_by(|(a, _), (b, _)| {
            utils::path_depth(b).cmp(&utils::path_depth(a)).then_with(|| a.cmp(b))
        });

        plan.tracked_junk = target
            .keys()
            .filter(|path| path.file_name().is_some_and(|name| utils::is_junk_file(&name.to_string_lossy())))
            .cloned()
            .collect();

        for (path, wanted) in target {
            if exclusions.is_excluded(path) {
                trace!("Leaving excluded path {:?} alone", path);
                continue;
            }
            match live.get(path) {
                Some(current) if current.same_content(wanted) => {
                    if wanted.same_metadata(current) {
                        continue;
                    }
                    match self.fidelity {
                        MetadataFidelity::ContentOnly => {}
                        MetadataFidelity::InPlace => {
                            plan.to_touch.insert(path.clone(), wanted.clone());
                        }
                        MetadataFidelity::Rewrite => {
                            plan.to_write.insert(path.clone(), wanted.clone());
                        }
                    }
                }
                _ => {
                    plan.to_write.insert(path.clone(), wanted.clone());
                }
            }
        }

        debug!(
            "Plan for scope '{}': {} delete, {} write, {} touch, {} protected",
            scope.name,
            plan.to_delete.len(),
            plan.to_write.len(),
            plan.to_touch.len(),
            plan.protected.len()
        );
        Ok(plan)
    }

    /// Execute `plan`, stopping at the first failure
    #[instrument(skip_all, fields(target = %plan.target))]
    pub fn execute(
        &self,
        plan: &RestorePlan,
        scopes: &[Scope],
        cancel: Option<&CancelToken>,
        progress: Option<&ProgressCallback>,
    ) -> Result<RestoreReport> {
        let start = Instant::now();
        let summary = plan.summary();
        info!("Restoring {}: {}", utils::short_id(&plan.target), summary);

        let report = Mutex::new(RestoreReport {
            target: plan.target.clone(),
            summary,
            skipped_scopes: plan.skipped_scopes.clone(),
            ..RestoreReport::default()
        });
        let abort = |err: StrataError| {
            let mut report = report.lock().clone();
            report.cancelled = matches!(err, StrataError::Cancelled);
            report.duration = start.elapsed();
            warn!(
                "Restore aborted after {} of {} step(s): {}",
                report.completed_steps(),
                report.planned_steps(),
                err
            );
            StrataError::RestoreAborted {
                report: Box::new(report),
                source: Box::new(err),
            }
        };
        let check_cancel = || match cancel {
            Some(token) if token.is_cancelled() => Err(StrataError::Cancelled),
            _ => Ok(()),
        };
        let total = summary.total_steps();
        let done = AtomicUsize::new(0);
        let report_progress = |operation: &str, path: &Path| {
            let processed = done.fetch_add(1, Ordering::Relaxed) + 1;
            if let Some(callback) = progress {
                callback(ProgressInfo {
                    operation: operation.to_string(),
                    current_item: Some(utils::slash_path(path)),
                    processed,
                    total: Some(total),
                });
            }
        };

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.parallel_workers)
            .build()
            .map_err(|e| abort(e.into()))?;

        for scope_plan in &plan.scopes {
            let scope = scopes
                .iter()
                .find(|s| s.name == scope_plan.scope)
                .ok_or_else(|| abort(StrataError::UnknownScope(scope_plan.scope.clone())))?;

            for (relative, _) in &scope_plan.to_delete {
                check_cancel().map_err(&abort)?;
                delete_path(&scope_plan.root.join(relative)).map_err(&abort)?;
                report.lock().deleted += 1;
                report_progress("Deleting", relative);
            }

            check_cancel().map_err(&abort)?;
            let removed = self.remove_empty_dirs(scope, &scope_plan.tracked_junk).map_err(&abort)?;
            report.lock().directories_removed += removed;

            let touched_dirs = Mutex::new(BTreeSet::new());
            let bytes_written = AtomicU64::new(0);
            let writes: Vec<(&PathBuf, &FileEntry)> = scope_plan.to_write.iter().collect();
            pool.install(|| {
                writes.par_iter().try_for_each(|(relative, entry)| -> Result<()> {
                    check_cancel()?;
                    let dest = scope_plan.root.join(relative);
                    let bytes = self.write_entry(&dest, entry)?;
                    if let Some(parent) = dest.parent() {
                        touched_dirs.lock().insert(parent.to_path_buf());
                    }
                    bytes_written.fetch_add(bytes, Ordering::Relaxed);
                    report.lock().written += 1;
                    report_progress("Writing", relative);
                    Ok(())
                })
            })
            .map_err(|e| {
                report.lock().bytes_written += bytes_written.load(Ordering::Relaxed);
                abort(e)
            })?;
            report.lock().bytes_written += bytes_written.load(Ordering::Relaxed);
            for dir in touched_dirs.into_inner() {
                utils::sync_dir(&dir).map_err(&abort)?;
            }

            for (relative, entry) in &scope_plan.to_touch {
                check_cancel().map_err(&abort)?;
                touch_entry(&scope_plan.root.join(relative), entry).map_err(&abort)?;
                report.lock().touched += 1;
                report_progress("Touching", relative);
            }
        }

        let mut report = report.into_inner();
        report.duration = start.elapsed();
        info!(
            "Restore finished: {} deleted, {} written ({}), {} touched, {} director(ies) removed in {}",
            report.deleted,
            report.written,
            format_bytes(report.bytes_written),
            report.touched,
            report.directories_removed,
            humantime::format_duration(Duration::from_millis(report.duration.as_millis() as u64))
        );
        Ok(report)
    }

    /// Stream a block into place through a temporary file
    fn write_entry(&self, dest: &Path, entry: &FileEntry) -> Result<u64> {
        let parent = dest
            .parent()
            .ok_or_else(|| StrataError::internal(format!("{:?} has no parent directory", dest)))?;
        fs::create_dir_all(parent)?;
        clear_directory_at(dest)?;

        match &entry.kind {
            EntryKind::Symlink { target } => {
                let temp_link = parent.join(format!(".strata-link-{}", uuid::Uuid::new_v4().simple()));
                utils::create_symlink(target, &temp_link)?;
                replace_with(&temp_link, dest)?;
                trace!("Linked {:?} -> {:?}", dest, target);
                Ok(0)
            }
            EntryKind::File => {
                let mut temp = NamedTempFile::new_in(parent)?;
                let written = {
                    let mut writer = BufWriter::with_capacity(IO_BUFFER_SIZE, temp.as_file_mut());
                    let written = self.store.copy_to(&entry.content_hash, &mut writer)?;
                    writer.flush()?;
                    written
                };
                if written != entry.size {
                    return Err(StrataError::corrupt(
                        &entry.content_hash,
                        format!("block holds {} bytes, manifest expects {}", written, entry.size),
                    ));
                }
                utils::set_modified(temp.path(), entry.modified)?;
                utils::set_permissions(temp.path(), entry.permissions)?;
                temp.as_file().sync_all()?;
                prepare_replace(dest)?;
                temp.persist(dest).map_err(|e| StrataError::Io(e.error))?;
                trace!("Wrote {:?} ({} bytes)", dest, written);
                Ok(written)
            }
        }
    }

    /// Remove empty directories under the scope root, deepest first. With junk
    /// files ignored, directories holding only untracked junk count as empty.
    fn remove_empty_dirs(&self, scope: &Scope, tracked_junk: &BTreeSet<PathBuf>) -> Result<usize> {
        let exclusions = ExclusionMatcher::new(scope)?;
        let storage_path = self.storage_path.clone();
        let root = scope.path.clone();
        let mut removed = 0;

        let walker = walkdir::WalkDir::new(&scope.path)
            .min_depth(1)
            .contents_first(true)
            .follow_links(false)
            .into_iter()
            .filter_entry(move |e| !e.path().starts_with(&storage_path));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable directory during cleanup: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_dir() {
                continue;
            }
            let path = entry.path();
            let Ok(relative) = path.strip_prefix(&root) else {
                continue;
            };
            if exclusions.is_excluded(relative) || self.is_protected(scope, relative) {
                continue;
            }
            let strippable = |name: &str| self.strip_junk && !tracked_junk.contains(&relative.join(name));
            if remove_dir_if_empty(path, strippable)? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Delete a file or symlink; already gone is fine
fn delete_path(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            trace!("Deleted {:?}", path);
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            #[cfg(windows)]
            if e.kind() == io::ErrorKind::PermissionDenied {
                // Read-only files cannot be deleted on windows
                utils::set_permissions(path, 0o644)?;
                fs::remove_file(path)?;
                return Ok(());
            }
            Err(e.into())
        }
    }
}

/// Remove `path` if it holds nothing but junk files `strippable` allows
fn remove_dir_if_empty(path: &Path, strippable: impl Fn(&str) -> bool) -> Result<bool> {
    let mut junk = Vec::new();
    for child in fs::read_dir(path)? {
        let child = child?;
        let name = child.file_name().to_string_lossy().to_string();
        if child.file_type()?.is_file() && utils::is_junk_file(&name) && strippable(&name) {
            junk.push(child.path());
        } else {
            return Ok(false);
        }
    }
    for file in junk {
        fs::remove_file(file)?;
    }
    match fs::remove_dir(path) {
        Ok(()) => {
            trace!("Removed empty directory {:?}", path);
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// A directory standing where a file must go is removed if empty
fn clear_directory_at(dest: &Path) -> Result<()> {
    match fs::symlink_metadata(dest) {
        Ok(meta) if meta.is_dir() => {
            fs::remove_dir(dest)?;
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Make an existing destination replaceable by rename
#[cfg(windows)]
fn prepare_replace(dest: &Path) -> Result<()> {
    if let Ok(meta) = fs::symlink_metadata(dest) {
        if meta.permissions().readonly() {
            utils::set_permissions(dest, 0o644)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn prepare_replace(_dest: &Path) -> Result<()> {
    Ok(())
}

/// Rename `from` over `to`
fn replace_with(from: &Path, to: &Path) -> Result<()> {
    #[cfg(windows)]
    if fs::symlink_metadata(to).is_ok() {
        delete_path(to)?;
    }
    if let Err(e) = fs::rename(from, to) {
        fs::remove_file(from).ok();
        return Err(e.into());
    }
    Ok(())
}

/// Fix metadata of a file whose content already matches
fn touch_entry(path: &Path, entry: &FileEntry) -> Result<()> {
    if entry.is_symlink() {
        return Ok(());
    }
    prepare_replace(path)?;
    utils::set_modified(path, entry.modified)?;
    utils::set_permissions(path, entry.permissions)?;
    trace!("Touched {:?}", path);
    Ok(())
}
