//! # Strata CLI - snapshots for large directory trees
//!
//! Command-line front end for the strata engine.
//!
//! ## Usage
//! ```bash
//! # Initialize a store tracking a game install and its config folder
//! strata init --scope game=/games/skyrim --scope config=~/.config/skyrim
//!
//! # Capture the untouched state
//! strata snapshot -m "Vanilla"
//!
//! # See what going back would change, then go back
//! strata preview <snapshot-id>
//! strata restore <snapshot-id>
//!
//! # Drop an old state and reclaim its space
//! strata prune <snapshot-id> --policy reparent
//! strata gc
//! ```

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strata::{
    default_skip_extensions, format_bytes, ChangeSet, CompressionStrategy, MetadataFidelity, ProgressCallback, PrunePolicy,
    RestoreOptions, Scope, SnapshotOptions, Strata, StrataConfig, StrataError,
};
use tracing_subscriber::EnvFilter;

/// Strata CLI - snapshot and restore whole directory trees
#[derive(Parser)]
#[command(name = "strata")]
#[command(version)]
#[command(about = "Delta-based snapshots for very large directory trees")]
#[command(long_about = None)]
struct Cli {
    /// Storage directory (defaults to ./.strata)
    #[arg(short, long, global = true)]
    storage: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new store
    Init {
        /// Scopes to track, as NAME=PATH
        #[arg(long = "scope", value_parser = parse_scope_binding)]
        scopes: Vec<(String, PathBuf)>,

        /// Exclusion globs, as NAME=GLOB
        #[arg(short = 'x', long = "exclude", value_parser = parse_exclusion)]
        exclusions: Vec<(String, String)>,

        /// Compression strategy
        #[arg(long, value_enum, default_value = "fast")]
        compression: CompressionMode,

        /// Restore metadata fidelity
        #[arg(long, value_enum, default_value = "in-place")]
        fidelity: FidelityMode,

        /// Store a full layer every N generations
        #[arg(long)]
        full_interval: Option<usize>,

        /// Paths restore must never delete (globs over scope/relative)
        #[arg(short, long)]
        protect: Vec<String>,

        /// Worker threads
        #[arg(short = 'j', long)]
        jobs: Option<usize>,
    },

    /// Manage scopes
    #[command(subcommand)]
    Scope(ScopeCommand),

    /// Snapshot every scope as a child of the head
    #[command(alias = "snap")]
    Snapshot {
        /// Label
        #[arg(short, long)]
        message: Option<String>,

        /// Only snapshot these scopes
        #[arg(long = "only")]
        only: Vec<String>,

        /// Accept a scan that could not read every path
        #[arg(long)]
        allow_partial: bool,

        #[command(flatten)]
        progress: ProgressArgs,
    },

    /// Make every scope match a snapshot
    #[command(alias = "rs")]
    Restore {
        /// Snapshot id or unique prefix
        snapshot: String,

        /// Print the plan without executing it
        #[arg(long)]
        dry_run: bool,

        /// Reuse stored hashes for files whose size and mtime match
        #[arg(long)]
        trust_mtime: bool,

        /// Proceed even if some paths could not be read
        #[arg(long)]
        allow_partial: bool,

        #[command(flatten)]
        progress: ProgressArgs,
    },

    /// Show what restoring a snapshot would change
    Preview {
        /// Snapshot id or unique prefix
        snapshot: String,

        /// Show at most this many paths per category
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Remove a snapshot from the lineage
    Prune {
        /// Snapshot id or unique prefix
        snapshot: String,

        /// What happens to its children
        #[arg(long, value_enum, default_value = "reject")]
        policy: PolicyMode,

        /// Print the plan without executing it
        #[arg(long)]
        dry_run: bool,
    },

    /// Delete blocks no snapshot references
    Gc {
        /// Dry run
        #[arg(long)]
        dry_run: bool,
    },

    /// List snapshots
    #[command(alias = "ls")]
    List {
        /// Show per-scope layer details
        #[arg(short, long)]
        detailed: bool,

        /// Limit results
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show the lineage tree
    Tree,

    /// Show snapshot details
    Show {
        /// Snapshot id or unique prefix
        snapshot: String,
    },

    /// Verify integrity
    Verify {
        /// Snapshot to verify
        snapshot: Option<String>,

        /// Verify all
        #[arg(long)]
        all: bool,
    },

    /// Show head and storage statistics
    Status,
}

#[derive(Subcommand)]
enum ScopeCommand {
    /// Track a new directory tree
    Add {
        /// Scope name
        name: String,

        /// Directory
        path: PathBuf,

        /// Exclusion globs (gitignore syntax)
        #[arg(short = 'x', long)]
        exclude: Vec<String>,
    },

    /// Stop tracking a scope no snapshot references
    Remove {
        /// Scope name
        name: String,
    },

    /// List scopes
    List,
}

#[derive(Args)]
struct ProgressArgs {
    /// Show progress
    #[arg(long)]
    progress: bool,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum CompressionMode {
    None,
    Fast,
    Adaptive,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum FidelityMode {
    ContentOnly,
    InPlace,
    Rewrite,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum PolicyMode {
    Reject,
    Reparent,
    Cascade,
}

impl From<PolicyMode> for PrunePolicy {
    fn from(mode: PolicyMode) -> Self {
        match mode {
            PolicyMode::Reject => PrunePolicy::Reject,
            PolicyMode::Reparent => PrunePolicy::Reparent,
            PolicyMode::Cascade => PrunePolicy::Cascade,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "strata=debug" } else { "strata=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli) {
        let message = match e.downcast_ref::<StrataError>() {
            Some(err) => err.user_message(),
            None => format!("{:#}", e),
        };
        eprintln!("{}: {}", "Error".red().bold(), message);
        let code = match e.downcast_ref::<StrataError>() {
            Some(StrataError::WorldLocked(_)) => 3,
            Some(err) if err.is_recoverable() => 2,
            _ => 1,
        };
        std::process::exit(code);
    }
}

/// Main command runner
fn run(cli: Cli) -> anyhow::Result<()> {
    let storage_path = cli.storage.unwrap_or_else(|| PathBuf::from(".strata"));

    match cli.command {
        Commands::Init {
            scopes,
            exclusions,
            compression,
            fidelity,
            full_interval,
            protect,
            jobs,
        } => cmd_init(&storage_path, scopes, exclusions, compression, fidelity, full_interval, protect, jobs),
        Commands::Scope(command) => cmd_scope(&storage_path, command),
        Commands::Snapshot {
            message,
            only,
            allow_partial,
            progress,
        } => cmd_snapshot(&storage_path, message, only, allow_partial, progress.progress),
        Commands::Restore {
            snapshot,
            dry_run,
            trust_mtime,
            allow_partial,
            progress,
        } => cmd_restore(&storage_path, &snapshot, dry_run, trust_mtime, allow_partial, progress.progress),
        Commands::Preview { snapshot, limit } => cmd_preview(&storage_path, &snapshot, limit),
        Commands::Prune {
            snapshot,
            policy,
            dry_run,
        } => cmd_prune(&storage_path, &snapshot, policy.into(), dry_run),
        Commands::Gc { dry_run } => cmd_gc(&storage_path, dry_run),
        Commands::List { detailed, limit } => cmd_list(&storage_path, detailed, limit),
        Commands::Tree => cmd_tree(&storage_path),
        Commands::Show { snapshot } => cmd_show(&storage_path, &snapshot),
        Commands::Verify { snapshot, all } => cmd_verify(&storage_path, snapshot, all),
        Commands::Status => cmd_status(&storage_path),
    }
}

/// Create the storage directory and register the initial scopes
///
/// The storage directory contains:
/// - metadata.json: configuration and format version
/// - scopes.json, head.json: scope table and head pointer
/// - snapshots/, manifests/: snapshot headers and their layers
/// - objects/: content-addressed blocks
#[allow(clippy::too_many_arguments)]
fn cmd_init(
    storage_path: &Path,
    scopes: Vec<(String, PathBuf)>,
    exclusions: Vec<(String, String)>,
    compression: CompressionMode,
    fidelity: FidelityMode,
    full_interval: Option<usize>,
    protect: Vec<String>,
    jobs: Option<usize>,
) -> anyhow::Result<()> {
    println!("{}", "Initializing strata...".blue().bold());

    let mut config = StrataConfig::new(storage_path.to_path_buf());
    config.compression = match compression {
        CompressionMode::None => CompressionStrategy::None,
        CompressionMode::Fast => CompressionStrategy::Fast,
        CompressionMode::Adaptive => CompressionStrategy::Adaptive {
            min_size: 4096,
            skip_extensions: default_skip_extensions(),
        },
    };
    config.fidelity = match fidelity {
        FidelityMode::ContentOnly => MetadataFidelity::ContentOnly,
        FidelityMode::InPlace => MetadataFidelity::InPlace,
        FidelityMode::Rewrite => MetadataFidelity::Rewrite,
    };
    config.full_manifest_interval = full_interval;
    config.protected_patterns = protect;
    if let Some(jobs) = jobs {
        config.parallel_workers = jobs.max(1);
    }

    let strata = Strata::init(storage_path, config)
        .with_context(|| format!("cannot initialize {}", storage_path.display()))?;
    if let Some((name, _)) = exclusions.iter().find(|(name, _)| !scopes.iter().any(|(s, _)| s == name)) {
        bail!("--exclude names unknown scope '{}'", name);
    }
    for (name, path) in scopes {
        let patterns: Vec<String> = exclusions
            .iter()
            .filter(|(scope, _)| *scope == name)
            .map(|(_, glob)| glob.clone())
            .collect();
        let scope = strata.add_scope(Scope::new(name, absolute(&path)?).with_exclusions(patterns))?;
        println!("  Scope {}: {}", scope.name.green(), scope.path.display().to_string().cyan());
    }

    println!("{} Initialized strata", "✓".green().bold());
    println!("  Storage: {}", strata.storage_path().display().to_string().cyan());
    println!("\nNext steps:");
    if strata.scopes().is_empty() {
        println!("  - Add a scope: {}", "strata scope add game /path/to/game".yellow());
    }
    println!("  - Capture the current state: {}", "strata snapshot -m \"Vanilla\"".yellow());
    Ok(())
}

fn cmd_scope(storage_path: &Path, command: ScopeCommand) -> anyhow::Result<()> {
    let strata = open_strata(storage_path)?;
    match command {
        ScopeCommand::Add { name, path, exclude } => {
            let scope = strata.add_scope(Scope::new(name, absolute(&path)?).with_exclusions(exclude))?;
            println!(
                "{} Added scope {} at {}",
                "✓".green().bold(),
                scope.name.green().bold(),
                scope.path.display().to_string().cyan()
            );
        }
        ScopeCommand::Remove { name } => {
            strata.remove_scope(&name)?;
            println!("{} Removed scope {}", "✓".green().bold(), name.yellow());
        }
        ScopeCommand::List => {
            let scopes = strata.scopes();
            if scopes.is_empty() {
                println!("{}", "No scopes configured.".yellow());
            }
            for scope in scopes {
                println!("{} {}", scope.name.green().bold(), scope.path.display().to_string().cyan());
                for pattern in &scope.exclusions {
                    println!("    exclude {}", pattern.dimmed());
                }
            }
        }
    }
    Ok(())
}

/// Capture every scope (or the selected ones)
///
/// Only paths that differ from the head are stored, and content already
/// present in the store is never stored twice.
fn cmd_snapshot(
    storage_path: &Path,
    message: Option<String>,
    only: Vec<String>,
    allow_partial: bool,
    show_progress: bool,
) -> anyhow::Result<()> {
    let strata = open_strata(storage_path)?;
    println!("{}", "Creating snapshot...".blue().bold());

    let start = Instant::now();
    let (bar, callback) = progress_bar(show_progress, "Scanning")?;
    let options = SnapshotOptions {
        label: message.unwrap_or_default(),
        scopes: (!only.is_empty()).then_some(only),
        allow_partial,
        progress_callback: callback,
    };
    let result = strata.snapshot_with_options(options);
    if let Some(bar) = bar {
        bar.finish_and_clear();
    }
    let snapshot = result?;

    println!(
        "{} Created snapshot {}",
        "✓".green().bold(),
        snapshot.short_id().yellow().bold()
    );
    if !snapshot.label.is_empty() {
        println!("  Label: {}", snapshot.label.cyan());
    }
    match &snapshot.parent_id {
        Some(parent) => println!("  Parent: {}", short(parent).yellow()),
        None => println!("  Parent: {}", "none (root)".dimmed()),
    }
    for (scope, stats) in &snapshot.scopes {
        println!(
            "  {}: {} changed, {} removed, {}{}",
            scope.green(),
            stats.entries,
            stats.tombstones,
            format_bytes(stats.bytes),
            if stats.full { " (full)" } else { "" }
        );
    }
    if snapshot.partial {
        println!("  {}", "Partial: some paths could not be read".yellow());
    }
    println!("  Time: {}", format_duration(round(start.elapsed())).to_string().cyan());
    Ok(())
}

/// Make every scope match a snapshot exactly
///
/// The plan is printed first. Files not in the snapshot are deleted, so
/// protected patterns and scope exclusions are the only way to keep them.
fn cmd_restore(
    storage_path: &Path,
    snapshot: &str,
    dry_run: bool,
    trust_mtime: bool,
    allow_partial: bool,
    show_progress: bool,
) -> anyhow::Result<()> {
    let strata = open_strata(storage_path)?;
    let target = strata.find_snapshot(snapshot)?;

    let plan_options = RestoreOptions {
        allow_partial,
        trust_mtime,
        ..RestoreOptions::default()
    };
    let plan = strata.plan_restore_with_options(&target.id, &plan_options)?;
    println!(
        "{} {} {}",
        "Restore plan for".blue().bold(),
        target.short_id().yellow(),
        target.label.cyan()
    );
    println!("  {}", plan.summary());
    if let Some(head) = strata.head() {
        if head.id == target.id && plan.is_empty() {
            println!("{}", "Already at this state.".green());
            return Ok(());
        }
    }
    if dry_run {
        for scope in &plan.scopes {
            for (path, _) in scope.to_delete.iter().take(10) {
                println!("  {} {}/{}", "-".red(), scope.scope, path.display());
            }
            for path in scope.to_write.keys().take(10) {
                println!("  {} {}/{}", "+".green(), scope.scope, path.display());
            }
        }
        println!("\n{}", "No changes made (dry run)".dimmed());
        return Ok(());
    }

    let (bar, callback) = progress_bar(show_progress, "Restoring")?;
    let options = RestoreOptions {
        progress_callback: callback,
        ..plan_options
    };
    let result = strata.execute_restore(&plan, options);
    if let Some(bar) = bar {
        bar.finish_and_clear();
    }
    let report = result?;

    println!("{} Restore complete", "✓".green().bold());
    println!("  Files deleted: {}", report.deleted.to_string().yellow());
    println!("  Directories removed: {}", report.directories_removed.to_string().yellow());
    println!("  Files written: {}", report.written.to_string().cyan());
    println!("  Bytes written: {}", format_bytes(report.bytes_written).cyan());
    println!("  Metadata fixed: {}", report.touched.to_string().cyan());
    if !report.skipped_scopes.is_empty() {
        println!("  Untouched scopes (no history): {}", report.skipped_scopes.join(", ").dimmed());
    }
    println!("  Time: {}", format_duration(round(report.duration)).to_string().cyan());
    Ok(())
}

fn cmd_preview(storage_path: &Path, snapshot: &str, limit: usize) -> anyhow::Result<()> {
    let strata = open_strata(storage_path)?;
    let target = strata.find_snapshot(snapshot)?;
    let changes = strata.preview(&target.id)?;

    println!(
        "{} {} {}",
        "Restoring".blue().bold(),
        target.short_id().yellow(),
        "would change:".blue().bold()
    );
    if !changes.has_changes() {
        println!("  {}", "nothing".green());
        return Ok(());
    }
    print_paths("Delete", "-".red(), &changes.added, limit);
    print_paths("Write back", "+".green(), &changes.removed, limit);
    print_paths("Overwrite", "~".yellow(), &changes.modified, limit);
    print_paths("Fix metadata", "m".cyan(), &changes.metadata_only, limit);
    print_issues(&changes);
    Ok(())
}

/// Remove a snapshot; blocks are reclaimed by a later gc
fn cmd_prune(storage_path: &Path, snapshot: &str, policy: PrunePolicy, dry_run: bool) -> anyhow::Result<()> {
    let strata = open_strata(storage_path)?;
    let target = strata.find_snapshot(snapshot)?;
    let plan = strata.lineage().plan_removal(&target.id, policy)?;

    println!("{} {}", "Prune plan for".blue().bold(), target.short_id().yellow());
    println!("  Remove: {} snapshot(s)", plan.removed.len().to_string().red());
    for id in &plan.removed {
        println!("    {}", short(id).dimmed());
    }
    if !plan.reparented.is_empty() {
        let onto = plan.new_parent.as_deref().map(short).unwrap_or("nothing (new root)");
        println!("  Reparent: {} child(ren) onto {}", plan.reparented.len(), onto.yellow());
    }
    if let Some(head) = &plan.new_head {
        println!("  New head: {}", head.as_deref().map(short).unwrap_or("none").yellow());
    }
    if dry_run {
        println!("\n{}", "No changes made (dry run)".dimmed());
        return Ok(());
    }

    let report = strata.prune(&target.id, policy)?;
    println!("{} Pruned {} snapshot(s)", "✓".green().bold(), report.removed.len());
    println!("  References released: {}", report.references_released);
    println!(
        "  Reclaimable by gc: {} block(s), {}",
        report.blocks_now_unreferenced.to_string().green(),
        format_bytes(report.bytes_reclaimable).green()
    );
    Ok(())
}

/// Run garbage collection
fn cmd_gc(storage_path: &Path, dry_run: bool) -> anyhow::Result<()> {
    let strata = open_strata(storage_path)?;
    let start = Instant::now();

    if dry_run {
        println!("{}", "Analyzing garbage collection (dry run)...".blue().bold());
        let plan = strata.gc_analyze()?;

        println!("\n{}", "Analysis Results:".bold());
        println!("  Blocks examined: {}", plan.blocks_examined);
        println!("  Live blocks: {}", plan.live_blocks);
        println!("  Unreferenced blocks: {}", plan.candidates.len().to_string().yellow());
        println!("  Space to reclaim: {}", format_bytes(plan.bytes_to_reclaim).green());
        if !plan.refcount_drift.is_empty() {
            println!("  Refcounts to repair: {}", plan.refcount_drift.len().to_string().yellow());
        }
        if !plan.missing_blocks.is_empty() {
            println!("  Missing blocks: {}", plan.missing_blocks.len().to_string().red());
        }
        for (hash, size) in plan.candidates.iter().take(10) {
            println!("    {} {}", short16(hash).dimmed(), format_bytes(*size));
        }
        if plan.candidates.len() > 10 {
            println!("    ... and {} more", (plan.candidates.len() - 10).to_string().dimmed());
        }
        println!("\n{}", "No changes made (dry run)".dimmed());
    } else {
        println!("{}", "Running garbage collection...".blue().bold());
        let report = strata.gc()?;

        println!("\n{} Garbage collection complete", "✓".green().bold());
        println!("  Blocks deleted: {}", report.blocks_deleted.to_string().green());
        println!("  Space reclaimed: {}", format_bytes(report.bytes_reclaimed).green());
        if report.refcounts_repaired > 0 {
            println!("  Refcounts repaired: {}", report.refcounts_repaired.to_string().yellow());
        }
        if !report.failed.is_empty() {
            println!(
                "  {} {} block(s) could not be deleted and will be retried next time",
                "Warning:".yellow().bold(),
                report.failed.len()
            );
        }
        if !report.missing_blocks.is_empty() {
            println!(
                "  {} {} referenced block(s) are missing; run 'strata verify --all'",
                "Warning:".red().bold(),
                report.missing_blocks.len()
            );
        }
    }

    println!("\n{}", format!("Total time: {}", format_duration(round(start.elapsed()))).dimmed());
    Ok(())
}

fn cmd_list(storage_path: &Path, detailed: bool, limit: Option<usize>) -> anyhow::Result<()> {
    let strata = open_strata(storage_path)?;
    let snapshots = strata.list_snapshots();
    if snapshots.is_empty() {
        println!("{}", "No snapshots found.".yellow());
        return Ok(());
    }

    let head = strata.head().map(|s| s.id);
    println!("{}", "Snapshots:".blue().bold());
    println!();
    for snapshot in snapshots.iter().take(limit.unwrap_or(snapshots.len())) {
        let marker = if head.as_deref() == Some(snapshot.id.as_str()) {
            "*".green().bold()
        } else {
            " ".normal()
        };
        print!("{} {} ", marker, snapshot.short_id().yellow().bold());
        print!("{} ", snapshot.created_at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed());
        println!("{}", snapshot.label.cyan());

        if detailed {
            for (scope, stats) in &snapshot.scopes {
                println!(
                    "    {}: {} entries, {} tombstones, {}{}",
                    scope,
                    stats.entries,
                    stats.tombstones,
                    format_bytes(stats.bytes),
                    if stats.full { ", full" } else { "" }
                );
            }
        }
    }
    Ok(())
}

fn cmd_tree(storage_path: &Path) -> anyhow::Result<()> {
    let strata = open_strata(storage_path)?;
    match strata.tree() {
        Some(root) => print!("{}", root.format_tree("", true)),
        None => println!("{}", "No snapshots found.".yellow()),
    }
    Ok(())
}

fn cmd_show(storage_path: &Path, snapshot: &str) -> anyhow::Result<()> {
    let strata = open_strata(storage_path)?;
    let snapshot = strata.find_snapshot(snapshot)?;
    let size = strata.snapshot_size(&snapshot.id)?;
    let lineage = strata.lineage();

    println!("{} {}", "Snapshot".blue().bold(), snapshot.short_id().yellow().bold());
    println!();
    println!("{}", "Basic Information:".bold());
    println!("  Full ID: {}", snapshot.id.dimmed());
    println!("  Created: {}", snapshot.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if !snapshot.label.is_empty() {
        println!("  Label: {}", snapshot.label.cyan());
    }
    println!("  Host: {}", snapshot.host.hostname);

    println!("\n{}", "Relationships:".bold());
    match &snapshot.parent_id {
        Some(parent) => println!("  Parent: {}", short(parent).yellow()),
        None => println!("  Parent: {}", "None (root snapshot)".dimmed()),
    }
    let children = lineage.children(&snapshot.id);
    if !children.is_empty() {
        let ids: Vec<String> = children.iter().map(|c| c.short_id().to_string()).collect();
        println!("  Children: {}", ids.join(", ").yellow());
    }
    println!("  Depth: {}", lineage.depth(&snapshot.id)?);

    println!("\n{}", "Statistics:".bold());
    println!("  Files: {}", size.file_count.to_string().cyan());
    println!("  Total size: {}", format_bytes(size.logical_bytes).cyan());
    println!("  Stored in this snapshot: {}", format_bytes(size.layer_bytes).cyan());
    for (scope, stats) in &snapshot.scopes {
        println!(
            "  {}: {} changed, {} removed{}",
            scope.green(),
            stats.entries,
            stats.tombstones,
            if stats.full { " (full layer)" } else { "" }
        );
    }

    println!("\n{}", "Technical Details:".bold());
    println!("  State hash: {}", short16(&snapshot.state_hash).dimmed());
    println!("  Layers digest: {}", short16(&snapshot.layers_digest).dimmed());
    if snapshot.verify_integrity() {
        println!("  Integrity: {}", "✓ Valid".green());
    } else {
        println!("  Integrity: {}", "✗ Invalid".red());
    }
    Ok(())
}

fn cmd_verify(storage_path: &Path, snapshot: Option<String>, all: bool) -> anyhow::Result<()> {
    let strata = open_strata(storage_path)?;

    if all {
        println!("{}", "Verifying all snapshots...".blue().bold());
        let report = strata.verify_all()?;
        for snapshot_report in &report.snapshot_reports {
            let mark = if snapshot_report.is_valid() { "✓".green() } else { "✗".red() };
            println!("  {} {}", mark, short(&snapshot_report.snapshot_id));
            for error in report.snapshot_errors.get(&snapshot_report.snapshot_id).into_iter().flatten() {
                println!("      {}", error.red());
            }
        }
        for hash in &report.size_conflicts {
            println!("  {} block {} is referenced with conflicting sizes", "✗".red(), short(hash));
        }
        println!("\n{}", report.summary());
        if !report.is_valid() {
            bail!("verification found problems");
        }
        return Ok(());
    }

    let id = match snapshot {
        Some(id) => id,
        None => match strata.head() {
            Some(head) => head.id,
            None => bail!("no snapshot to verify"),
        },
    };
    let report = strata.verify(&id)?;
    println!("{}", report.summary());
    for error in &report.errors {
        println!("  {}", error.red());
    }
    if !report.is_valid() {
        bail!("snapshot {} failed verification", short(&report.snapshot_id));
    }
    Ok(())
}

fn cmd_status(storage_path: &Path) -> anyhow::Result<()> {
    let strata = open_strata(storage_path)?;
    println!("{}", "Strata Status:".blue().bold());
    println!();

    match strata.head() {
        Some(head) => {
            println!("{}", "Head:".bold());
            println!("  ID: {}", head.short_id().yellow());
            println!("  Created: {}", head.created_at.format("%Y-%m-%d %H:%M:%S"));
            if !head.label.is_empty() {
                println!("  Label: {}", head.label.cyan());
            }
        }
        None => println!("{}", "No head snapshot".yellow()),
    }

    let stats = strata.lineage().stats();
    println!("\n{}", "Lineage:".bold());
    println!("  Snapshots: {}", stats.total_snapshots);
    println!("  Leaves: {}", stats.leaf_snapshots);
    println!("  Branch points: {}", stats.branch_points);
    println!("  Depth: {}", stats.max_depth);

    let store = strata.store_stats()?;
    println!("\n{}", "Storage:".bold());
    println!("  Location: {}", strata.storage_path().display());
    println!("  Blocks: {}", store.block_count);
    println!("  Size: {}", format_bytes(store.stored_bytes));
    if store.unreferenced_blocks > 0 {
        println!(
            "  Unreferenced: {} (run {})",
            store.unreferenced_blocks.to_string().yellow(),
            "strata gc".yellow()
        );
    }
    Ok(())
}

// Helper functions

fn open_strata(storage_path: &Path) -> anyhow::Result<Strata> {
    Strata::open(storage_path).with_context(|| {
        format!(
            "{} is not a strata store; run 'strata init' first",
            storage_path.display()
        )
    })
}

fn parse_scope_binding(raw: &str) -> Result<(String, PathBuf), String> {
    match raw.split_once('=') {
        Some((name, path)) if !name.is_empty() && !path.is_empty() => Ok((name.to_string(), PathBuf::from(path))),
        _ => Err(format!("expected NAME=PATH, got '{}'", raw)),
    }
}

fn parse_exclusion(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, glob)) if !name.is_empty() && !glob.is_empty() => Ok((name.to_string(), glob.to_string())),
        _ => Err(format!("expected NAME=GLOB, got '{}'", raw)),
    }
}

fn absolute(path: &Path) -> anyhow::Result<PathBuf> {
    fs::canonicalize(path).with_context(|| format!("cannot resolve {}", path.display()))
}

fn progress_bar(enabled: bool, message: &'static str) -> anyhow::Result<(Option<ProgressBar>, Option<ProgressCallback>)> {
    if !enabled {
        return Ok((None, None));
    }
    let bar = ProgressBar::new_spinner();
    bar.set_style(ProgressStyle::default_bar().template("{spinner:.green} {msg} [{bar:30.cyan/blue}] {pos}/{len}")?);
    bar.set_message(message);
    bar.enable_steady_tick(Duration::from_millis(120));

    let handle = bar.clone();
    let callback: ProgressCallback = Arc::new(move |info| {
        if let Some(total) = info.total {
            handle.set_length(total as u64);
        }
        handle.set_position(info.processed as u64);
        handle.set_message(info.operation);
    });
    Ok((Some(bar), Some(callback)))
}

fn print_paths(title: &str, marker: ColoredString, paths: &std::collections::BTreeSet<PathBuf>, limit: usize) {
    if paths.is_empty() {
        return;
    }
    println!("\n{} ({})", title.bold(), paths.len());
    for path in paths.iter().take(limit) {
        println!("  {} {}", marker, path.display());
    }
    if paths.len() > limit {
        println!("  ... and {} more", (paths.len() - limit).to_string().dimmed());
    }
}

fn print_issues(changes: &ChangeSet) {
    if changes.issues.is_empty() {
        return;
    }
    println!("\n{} ({})", "Unreadable".red().bold(), changes.issues.len());
    for issue in changes.issues.iter().take(10) {
        println!("  {} {}", issue.path.display(), issue.reason.dimmed());
    }
}

fn short(id: &str) -> &str {
    &id[..id.len().min(8)]
}

fn short16(hash: &str) -> &str {
    &hash[..hash.len().min(16)]
}

fn round(duration: Duration) -> Duration {
    Duration::from_millis(duration.as_millis() as u64)
}
