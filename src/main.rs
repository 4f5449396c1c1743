//! iptsync - declarative iptables reconciliation
//!
//! Reads a JSON file of declared rules and converges the live iptables rule
//! set onto it with the fewest inserts and deletes.
//!
//! # Usage
//!
//! ```bash
//! iptsync apply rules.json              # One reconciliation pass
//! iptsync apply rules.json --dry-run    # Report what would change
//! iptsync plan rules.json               # Dry run plus a live/desired diff
//! iptsync render rules.json             # Canonical desired rule lines
//! iptsync show --ordinal                # Parsed live rules with their keys
//! iptsync snapshots                     # Saved pre-apply dumps
//! ```
//!
//! # Exit codes
//!
//! - `0`: converged (or nothing to do)
//! - `1`: the pass failed or aborted
//! - `2`: a dry run found pending changes

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use similar::TextDiff;
use tracing::{Level, warn};

use iptsync::audit;
use iptsync::config::{self, Config};
use iptsync::core::desired::{DesiredSet, DesiredStateBuilder, load_declarations};
use iptsync::core::live::{KeyMode, LiveStateReader};
use iptsync::core::reconcile::{PassState, PersistStatus, ReconcileReport, Reconciler};
use iptsync::core::snapshot;
use iptsync::core::store::{IptablesStore, RuleStore};
use iptsync::facts;
use iptsync::utils;

shadow_rs::shadow!(build);

#[derive(Parser)]
#[command(name = "iptsync")]
#[command(about = "Converge live iptables rules onto a declared rule set", long_about = None)]
#[command(version, long_version = build::CLAP_LONG_VERSION)]
struct Cli {
    /// Config file (default: ~/.config/iptsync/config.json)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// More logging (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one reconciliation pass
    Apply {
        /// Declaration file (JSON)
        file: PathBuf,
        /// Report the operations without executing them
        #[arg(long)]
        dry_run: bool,
        /// Do not save the rules for the next boot
        #[arg(long)]
        no_persist: bool,
    },
    /// Dry run plus a diff of live against desired rules
    Plan {
        /// Declaration file (JSON)
        file: PathBuf,
    },
    /// Print the canonical desired rule lines
    Render {
        /// Declaration file (JSON)
        file: PathBuf,
    },
    /// Print the parsed live rules
    Show {
        /// Key rules by position as well as text
        #[arg(long)]
        ordinal: bool,
    },
    /// List saved pre-apply snapshots and verify their checksums
    Snapshots,
}

/// Exit code for a dry run that found work to do
const EXIT_PENDING: u8 = 2;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(handle_cli(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::WARN
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .with_target(false)
        .init();
}

async fn handle_cli(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let config = config::load_config(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Apply {
            file,
            dry_run,
            no_persist,
        } => {
            let mut config = config;
            if no_persist {
                config.persist = false;
            }
            apply(&config, &file, dry_run).await
        }
        Commands::Plan { file } => plan(&config, &file).await,
        Commands::Render { file } => {
            let desired = load_desired(&config, &file).await?;
            for (table, rules) in &desired.tables {
                println!("*{table}");
                for rule in rules {
                    println!("{}", rule.text);
                }
            }
            if desired.rule_count() == 0 && !desired.rejected.is_empty() {
                return Ok(ExitCode::FAILURE);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Show { ordinal } => {
            show(&config, ordinal).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Snapshots => {
            let snapshots = snapshot::list_snapshots()?;
            if snapshots.is_empty() {
                println!("No snapshots saved.");
                return Ok(ExitCode::SUCCESS);
            }
            let mut all_valid = true;
            for path in snapshots {
                match snapshot::verify_snapshot(&path) {
                    Ok(()) => println!("✓ {}", path.display()),
                    Err(e) => {
                        all_valid = false;
                        println!("✗ {}: {e}", path.display());
                    }
                }
            }
            Ok(if all_valid {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

/// Loads and validates the declarations, printing every rejection.
async fn load_desired(config: &Config, file: &Path) -> Result<DesiredSet, Box<dyn std::error::Error>> {
    let declarations = load_declarations(file).await?;
    let mut builder = DesiredStateBuilder::new(config.codec_options());
    for declaration in &declarations {
        // Rejections are collected by the builder
        let _ = builder.push(declaration);
    }
    let desired = builder.finish();
    for rejection in &desired.rejected {
        eprintln!(
            "✗ Rejected '{}' ({}): {}",
            rejection.rule, rejection.constraint, rejection.message
        );
    }
    Ok(desired)
}

/// Persistence command: the config override, else the one for the OS family.
async fn persist_argv(config: &Config) -> Option<Vec<String>> {
    if let Some(command) = &config.persist_command {
        let argv = utils::split_command(command);
        return (!argv.is_empty()).then_some(argv);
    }
    let family = match config.os_family {
        Some(family) => family,
        None => facts::detect_os_family().await,
    };
    family.persist_command().map(utils::split_command)
}

async fn open_store(config: &Config) -> IptablesStore {
    IptablesStore::new(&config.iptables_command, &config.iptables_save_command)
        .wait_for_lock(config.wait_for_lock)
        .with_persist_command(persist_argv(config).await)
}

/// Takes the host-wide pass lock; held until the returned guard drops.
fn acquire_pass_lock() -> Result<Flock<std::fs::File>, Box<dyn std::error::Error>> {
    utils::ensure_dirs()?;
    let path = utils::lock_path().ok_or("state directory not found")?;
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&path)?;
    Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| -> Box<dyn std::error::Error> {
        if errno == Errno::EWOULDBLOCK {
            format!("another iptsync pass is running (lock {} is held)", path.display()).into()
        } else {
            format!("failed to lock {}: {errno}", path.display()).into()
        }
    })
}

/// Saves the current dump before anything is changed. Failure only warns.
async fn save_pre_apply_snapshot(store: &mut IptablesStore) {
    match store.dump().await {
        Ok(dump) => match snapshot::save_snapshot(&dump) {
            Ok(path) => audit::log_snapshot(Some(&path), None).await,
            Err(e) => {
                warn!("Failed to save pre-apply snapshot: {e}");
                audit::log_snapshot(None, Some(e.to_string())).await;
            }
        },
        // The pass itself reports an unreadable dump
        Err(e) => warn!("Skipping pre-apply snapshot: {e}"),
    }
}

async fn apply(config: &Config, file: &Path, dry_run: bool) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let desired = load_desired(config, file).await?;
    let mut store = open_store(config).await;

    let _lock = if dry_run {
        None
    } else {
        Some(acquire_pass_lock()?)
    };
    if !dry_run {
        save_pre_apply_snapshot(&mut store).await;
    }

    let reconciler = Reconciler::new(config.reconcile_options(dry_run));
    let report = match reconciler.reconcile(&desired, &mut store).await {
        Ok(report) => report,
        Err(e) => {
            eprintln!("✗ Pass aborted before any change: {e}");
            return Ok(ExitCode::FAILURE);
        }
    };

    if !dry_run {
        let fingerprint = snapshot::compute_checksum(&desired.canonical_lines().join("\n"));
        audit::log_reconcile(&report, &fingerprint).await;
    }
    print_report(&report);
    Ok(exit_code(&report))
}

async fn plan(config: &Config, file: &Path) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let desired = load_desired(config, file).await?;
    let mut store = open_store(config).await;

    let reader = LiveStateReader::new(config.codec_options(), config.key_mode());
    let live = reader.read(&mut store).await?;
    let old = lines_with_newlines(&live.canonical_lines());
    let new = lines_with_newlines(&desired.canonical_lines());
    let diff = TextDiff::from_lines(&old, &new);
    if diff.ratio() < 1.0 {
        print!("{}", diff.unified_diff().context_radius(3).header("live", "desired"));
    }

    let reconciler = Reconciler::new(config.reconcile_options(true));
    let report = match reconciler.reconcile(&desired, &mut store).await {
        Ok(report) => report,
        Err(e) => {
            eprintln!("✗ {e}");
            return Ok(ExitCode::FAILURE);
        }
    };
    print_report(&report);
    Ok(exit_code(&report))
}

fn lines_with_newlines(lines: &[String]) -> String {
    lines.iter().map(|line| format!("{line}\n")).collect()
}

async fn show(config: &Config, ordinal: bool) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(version) = facts::iptables_version(&config.iptables_command).await {
        println!("iptables {version}");
    }

    let mode = if ordinal { KeyMode::Ordinal } else { KeyMode::Text };
    let mut store = open_store(config).await;
    let live = LiveStateReader::new(config.codec_options(), mode)
        .read(&mut store)
        .await?;

    if live.tables.is_empty() {
        println!("No managed rules.");
    }
    for (table, rules) in &live.tables {
        println!("*{table}");
        for key in rules.keys() {
            println!("  {key}");
        }
    }
    if !live.unmanaged.is_empty() {
        println!("Unmanaged ({}):", live.unmanaged.len());
        for line in &live.unmanaged {
            println!(
                "  {}/{}#{}: {} ({})",
                line.table, line.chain, line.ordinal, line.line, line.reason
            );
        }
    }
    Ok(())
}

fn print_report(report: &ReconcileReport) {
    if report.dry_run {
        if report.pending().is_empty() {
            println!("✓ Live rules match the declarations.");
        } else {
            println!("Pending operations ({}):", report.pending().len());
            for op in report.pending() {
                println!("  {op}");
            }
        }
    } else {
        for op in report.deleted.iter().chain(&report.inserted) {
            println!("✓ {op}");
        }
    }

    for failure in &report.failures {
        match failure.exit_code {
            Some(code) => println!("✗ {} (exit {code}): {}", failure.operation, failure.message),
            None => println!("✗ {}: {}", failure.operation, failure.message),
        }
    }
    for text in &report.missing {
        println!("✗ Still missing: {text}");
    }
    if report.loop_bounded {
        println!("✗ Delete loop stopped at its bound; the rule store did not converge.");
    }
    if let Some(reason) = &report.aborted {
        println!("✗ Pass aborted: {reason}");
    }
    if !report.unmanaged.is_empty() {
        println!("Left {} unmanaged rule(s) untouched.", report.unmanaged.len());
    }

    match &report.persist {
        PersistStatus::Skipped => {}
        PersistStatus::Saved { command } => println!("✓ Rules saved for next boot ({command})."),
        PersistStatus::Unavailable { reason } => {
            println!("! Rules will not survive a reboot: {reason}");
        }
        PersistStatus::Failed { message } => println!("! Saving rules for next boot failed: {message}"),
    }

    if !report.dry_run && report.state() == PassState::Converged {
        println!(
            "✓ Converged: {} inserted, {} deleted.",
            report.inserted.len(),
            report.deleted.len()
        );
    }
}

fn exit_code(report: &ReconcileReport) -> ExitCode {
    match report.state() {
        PassState::Failed => ExitCode::FAILURE,
        PassState::Converged if report.dry_run && !report.pending().is_empty() => {
            ExitCode::from(EXIT_PENDING)
        }
        PassState::Converged => ExitCode::SUCCESS,
    }
}
