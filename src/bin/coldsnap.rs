//! # Coldsnap CLI - Cold snapshots of VM storage
//!
//! Command-line front end for the coldsnap engine.
//!
//! ## Usage
//! ```bash
//! # Snapshot a runtime-managed volume
//! coldsnap create "before update" --volume vm-data
//!
//! # Snapshot a bind-mounted directory
//! coldsnap create "fresh install" --bind ~/.vm/storage
//!
//! # List snapshots, newest first
//! coldsnap list
//!
//! # Restore a snapshot
//! coldsnap restore 1700000000000-before_update --volume vm-data
//!
//! # Repair state after a crash and follow orphaned snapshots
//! coldsnap recover --attach
//! ```

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use coldsnap::utils::format_bytes;
use coldsnap::{
    CancellationToken, CliRuntime, EngineBuilder, JsonConfigStore, ProgressCallback, RecoveryReport,
    SnapshotEngine, SnapshotError, StorageDescriptor,
};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

/// Coldsnap CLI - snapshot and restore VM storage
#[derive(Parser)]
#[command(name = "coldsnap")]
#[command(version)]
#[command(about = "Cold snapshots of virtual machine storage")]
#[command(long_about = None)]
struct Cli {
    /// Configuration document holding snapshotPath and friends
    #[arg(short, long, global = true, default_value = "coldsnap.json")]
    config: PathBuf,

    /// Container runtime executable (docker or podman); detected when omitted
    #[arg(short, long, global = true)]
    runtime: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct StorageArgs {
    /// Runtime-managed volume name
    #[arg(long)]
    volume: Option<String>,

    /// Bind-mounted host directory
    #[arg(long)]
    bind: Option<PathBuf>,
}

impl StorageArgs {
    fn descriptor(&self) -> anyhow::Result<StorageDescriptor> {
        match (&self.volume, &self.bind) {
            (Some(volume), None) => Ok(StorageDescriptor::volume(volume.clone())),
            (None, Some(path)) => Ok(StorageDescriptor::bind(path.clone())),
            _ => bail!("pass exactly one of --volume or --bind"),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create a snapshot
    Create {
        /// Snapshot name
        name: String,

        #[command(flatten)]
        storage: StorageArgs,

        /// Use this id instead of `<timestamp>-<name>`
        #[arg(long)]
        id: Option<String>,
    },

    /// Restore a snapshot
    Restore {
        /// Snapshot id
        id: String,

        #[command(flatten)]
        storage: StorageArgs,
    },

    /// Delete a snapshot
    #[command(alias = "rm")]
    Delete {
        /// Snapshot id
        id: String,
    },

    /// List snapshots
    #[command(alias = "ls")]
    List {
        /// Limit results
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show lock state, snapshots in progress and pending retention
    Status,

    /// Repair state left by a previous run
    Recover {
        /// Follow snapshots still being written until they finish
        #[arg(long)]
        attach: bool,
    },

    /// Cancel a running or orphaned operation
    Cancel {
        /// Snapshot id
        id: Option<String>,
    },
}

impl Commands {
    /// Commands that change snapshots or storage and so need a recovered state
    fn mutates(&self) -> bool {
        matches!(
            self,
            Commands::Create { .. } | Commands::Restore { .. } | Commands::Delete { .. }
        )
    }
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_writer(std::io::stderr)
        .init();

    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli) {
        let message = match e.downcast_ref::<SnapshotError>() {
            Some(err) => err.user_message(),
            None => format!("{:#}", e),
        };
        eprintln!("{}: {}", "Error".red().bold(), message);
        if let Some(tail) = e.downcast_ref::<SnapshotError>().and_then(|err| err.diagnostic_tail()) {
            eprintln!("{}\n{}", "Last output:".dimmed(), tail.dimmed());
        }
        std::process::exit(1);
    }
}

fn open_engine(cli: &Cli) -> anyhow::Result<SnapshotEngine> {
    let store = Arc::new(JsonConfigStore::new(&cli.config));
    let mut builder = EngineBuilder::new(store);
    let runtime = match &cli.runtime {
        Some(exe) => Some(CliRuntime::new(exe.clone(), builder_image())),
        None => CliRuntime::detect(builder_image()).ok(),
    };
    if let Some(runtime) = runtime {
        builder = builder.runtime_exe(runtime.exe().to_string()).runtime(Arc::new(runtime));
    }
    builder
        .build()
        .with_context(|| format!("failed to open engine with {}", cli.config.display()))
}

fn builder_image() -> String {
    coldsnap::EngineOptions::default().helper_image
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let engine = Arc::new(open_engine(&cli)?);
    if cli.command.mutates() {
        print_report(&engine.recover().context("startup recovery failed")?);
    }

    match cli.command {
        Commands::Create { name, storage, id } => cmd_create(&engine, &name, &storage, id.as_deref()),
        Commands::Restore { id, storage } => cmd_restore(&engine, &id, &storage),
        Commands::Delete { id } => cmd_delete(&engine, &id),
        Commands::List { limit } => cmd_list(&engine, limit),
        Commands::Status => cmd_status(&engine),
        Commands::Recover { attach } => cmd_recover(&engine, attach),
        Commands::Cancel { id } => cmd_cancel(&engine, id.as_deref()),
    }
}

/// Run `on_signal` once SIGINT or SIGTERM arrives
///
/// Handlers are installed before returning, so a signal delivered after
/// this call never takes the default exit path.
fn on_interrupt(on_signal: impl FnOnce() + Send + 'static) -> anyhow::Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    let (mut interrupt, mut terminate) = {
        let _guard = rt.enter();
        (signal(SignalKind::interrupt())?, signal(SignalKind::terminate())?)
    };
    std::thread::spawn(move || {
        rt.block_on(async {
            tokio::select! {
                _ = interrupt.recv() => {}
                _ = terminate.recv() => {}
            }
        });
        on_signal();
    });
    Ok(())
}

fn spinner(message: &str) -> anyhow::Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(120));
    Ok(pb)
}

fn cmd_create(engine: &SnapshotEngine, name: &str, storage: &StorageArgs, id: Option<&str>) -> anyhow::Result<()> {
    let storage = storage.descriptor()?;

    let doomed = engine.preview_retention()?;
    if !doomed.is_empty() {
        println!("{}", "Retention will delete:".yellow().bold());
        for s in &doomed {
            println!("  {} {}", s.id.yellow(), s.name.dimmed());
        }
    }

    println!("{} {}", "Creating snapshot".blue().bold(), name.cyan());
    let start = Instant::now();
    let pb = spinner("Starting...")?;
    let progress: ProgressCallback = {
        let pb = pb.clone();
        Arc::new(move |bytes: u64| pb.set_message(format!("{} written", format_bytes(bytes))))
    };

    let cancel = CancellationToken::new();
    on_interrupt({
        let cancel = cancel.clone();
        let pb = pb.clone();
        move || {
            pb.set_message("Cancelling...");
            cancel.cancel();
        }
    })?;

    let result = engine.create_snapshot(name, &storage, Some(progress), &cancel, id);
    pb.finish_and_clear();
    let snapshot = result?;

    println!("{} Created snapshot {}", "✓".green().bold(), snapshot.id.yellow().bold());
    println!("  Size: {}", format_bytes(snapshot.size_bytes).cyan());
    println!("  Compressed: {}", snapshot.compressed.to_string().cyan());
    println!("  Time: {}", format_duration(round(start.elapsed())).to_string().cyan());
    Ok(())
}

fn cmd_restore(engine: &Arc<SnapshotEngine>, id: &str, storage: &StorageArgs) -> anyhow::Result<()> {
    let storage = storage.descriptor()?;
    println!("{} {}", "Restoring snapshot".blue().bold(), id.yellow());

    let start = Instant::now();
    let pb = spinner("Extracting...")?;
    on_interrupt({
        let engine = Arc::clone(engine);
        let pb = pb.clone();
        move || {
            pb.set_message("Cancelling...");
            if let Err(e) = engine.cancel_current(None) {
                tracing::warn!("Failed to cancel restore: {}", e);
            }
        }
    })?;
    let result = engine.restore_snapshot(id, &storage);
    pb.finish_and_clear();
    result?;

    println!("{} Restored {} into {}", "✓".green().bold(), id.yellow(), storage.path.cyan());
    println!("  Time: {}", format_duration(round(start.elapsed())).to_string().cyan());
    Ok(())
}

fn cmd_delete(engine: &SnapshotEngine, id: &str) -> anyhow::Result<()> {
    engine.delete_snapshot(id)?;
    println!("{} Deleted snapshot {}", "✓".green().bold(), id.yellow());
    Ok(())
}

fn cmd_list(engine: &SnapshotEngine, limit: Option<usize>) -> anyhow::Result<()> {
    let snapshots = engine.list_snapshots()?;
    if snapshots.is_empty() {
        println!("{}", "No snapshots found.".yellow());
        return Ok(());
    }

    let catalog = engine.catalog()?;
    println!("{}", "Snapshots:".blue().bold());
    println!();

    let display_count = limit.unwrap_or(snapshots.len()).min(snapshots.len());
    for snapshot in snapshots.iter().take(display_count) {
        let when = chrono::DateTime::from_timestamp_millis(snapshot.timestamp)
            .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        let state = if catalog.is_in_progress(&snapshot.id) {
            "in progress".yellow()
        } else if snapshot.compressed {
            "gz".normal()
        } else {
            "raw".normal()
        };

        println!(
            "  {} {} {} {} [{}]",
            snapshot.id.yellow().bold(),
            when.dimmed(),
            snapshot.name.cyan(),
            format_bytes(snapshot.size_bytes).dimmed(),
            state
        );
    }

    if display_count < snapshots.len() {
        println!(
            "\n{}",
            format!("Showing {} of {} snapshots", display_count, snapshots.len()).dimmed()
        );
    }
    Ok(())
}

fn cmd_status(engine: &SnapshotEngine) -> anyhow::Result<()> {
    match engine.busy_reason() {
        Some(reason) => println!("{} {} operation running", "Busy:".yellow().bold(), reason),
        None => println!("{}", "Idle".green().bold()),
    }

    let records = engine.in_progress()?;
    if !records.is_empty() {
        println!("\n{}", "In progress:".blue().bold());
        for (id, record) in records {
            let age = Duration::from_millis(coldsnap::utils::now_ms().saturating_sub(record.timestamp).max(0) as u64);
            println!(
                "  {} {} written, started {} ago",
                id.yellow(),
                format_bytes(record.current_size).cyan(),
                format_duration(round(age))
            );
        }
    }

    let doomed = engine.preview_retention()?;
    if !doomed.is_empty() {
        println!("\n{}", "Next snapshot will delete:".blue().bold());
        for s in doomed {
            println!("  {}", s.id.dimmed());
        }
    }
    Ok(())
}

fn print_report(report: &RecoveryReport) {
    if let Some(reason) = report.reclaimed_lock {
        println!("{} Reclaimed stale {} lock", "✓".green().bold(), reason);
    }
    if let Some(dest) = &report.rolled_back {
        println!("{} Rolled back {}", "✓".green().bold(), dest.display().to_string().cyan());
    }
    for id in &report.finalized {
        println!("{} Finalized {}", "✓".green().bold(), id.yellow());
    }
    for id in &report.pruned {
        println!("  Dropped stale record {}", id.dimmed());
    }
}

fn cmd_recover(engine: &SnapshotEngine, attach: bool) -> anyhow::Result<()> {
    print_report(&engine.recover()?);

    if !attach {
        return Ok(());
    }

    let pb = spinner("Looking for snapshots in progress...")?;
    let on_tick = {
        let pb = pb.clone();
        Arc::new(move |id: &str, bytes: u64| pb.set_message(format!("{}: {} written", id, format_bytes(bytes))))
    };
    let attached = engine.attach_to_in_progress(on_tick)?;
    if attached.is_empty() {
        pb.finish_and_clear();
        println!("Nothing in progress.");
        return Ok(());
    }

    let catalog = engine.catalog()?;
    while attached.iter().any(|id| catalog.is_in_progress(id)) {
        std::thread::sleep(Duration::from_secs(1));
    }
    engine.detach_all();
    pb.finish_and_clear();
    println!("{} {} snapshot(s) settled", "✓".green().bold(), attached.len());
    Ok(())
}

fn cmd_cancel(engine: &SnapshotEngine, id: Option<&str>) -> anyhow::Result<()> {
    if engine.cancel_current(id)? {
        println!("{} Cancelled", "✓".green().bold());
    } else {
        println!("{}", "Nothing to cancel.".yellow());
    }
    Ok(())
}

fn round(d: Duration) -> Duration {
    Duration::from_secs(d.as_secs())
}
