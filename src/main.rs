use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

mod config;
mod error;
mod executor;
mod integrations;
mod models;
mod normalize;
mod pairing;
mod reconcile;
mod sync;

use crate::config::{Config, config_path};
use crate::error::SyncError;
use crate::integrations::notion::NotionClient;
use crate::integrations::reminders::OsascriptStore;
use crate::normalize::cross_reference_url;
use crate::sync::RunMode;

const LOG_FILE: &str = "notion-reminders-sync.log";

#[derive(Parser)]
#[command(
    name = "notion-reminders-sync",
    version,
    about = "Two-way sync between a Notion task database and Apple Reminders"
)]
struct Cli {
    /// Path to config.toml (defaults to the platform config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is unset
    #[arg(long, env = "NRS_LOG", default_value = "info", global = true)]
    log_level: String,

    /// Print what would change without writing anything
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Copy)]
enum Command {
    /// Reconcile Notion and Reminders (default)
    Sync,
    /// Show the integration identity and workspace users
    Whoami,
    /// Link tagged reminders to open tasks with the same title
    FixUrls,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {err}");
            return ExitCode::from(1);
        }
    };
    let _guard = init_logging(&cli.log_level, config.logging.dir.as_deref());

    let result = match cli.command.unwrap_or(Command::Sync) {
        Command::Sync => run_sync(&config, cli.dry_run),
        Command::Whoami => whoami(&config),
        Command::FixUrls => fix_urls(&config, cli.dry_run),
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            error!(error = %err, "run failed");
            eprintln!("Error: {err}");
            ExitCode::from(1)
        }
    }
}

/// Logs go to a daily file when `logging.dir` is set, stderr otherwise.
/// The returned guard must live until exit so buffered lines are flushed.
fn init_logging(level: &str, dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    match dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_writer(writer)
                .with_env_filter(filter)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_env_filter(filter)
                .init();
            None
        }
    }
}

fn run_sync(config: &Config, dry_run: bool) -> Result<ExitCode, SyncError> {
    config.validate_for_sync()?;
    let remote = NotionClient::new(&config.notion)?;
    let local = OsascriptStore::new();
    let mode = if dry_run {
        RunMode::DryRun
    } else {
        RunMode::Apply
    };
    info!(?mode, list = %config.reminders.list_name, "starting sync");

    let outcome = sync::run(config, &remote, &local, mode)?;
    for line in outcome.plan.lines() {
        println!("{line}");
    }

    let Some(report) = outcome.report else {
        println!(
            "DRY RUN: {} operation(s) planned, nothing written.",
            outcome.plan.operation_count()
        );
        return Ok(ExitCode::SUCCESS);
    };
    for failure in &report.failures {
        println!("FAILED [{}] {}: {}", failure.key, failure.op, failure.error);
    }
    println!("{}", report.summary());
    if report.has_failures() {
        Ok(ExitCode::from(2))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

fn whoami(config: &Config) -> Result<ExitCode, SyncError> {
    config.validate_credentials()?;
    let client = NotionClient::new(&config.notion)?;
    let identity = client.whoami()?;

    println!(
        "Integration: {} ({})",
        identity.bot.name.as_deref().unwrap_or("unnamed"),
        identity.bot.id
    );
    println!();
    println!("Workspace users:");
    for user in &identity.users {
        let name = user.name.as_deref().unwrap_or("unnamed");
        if user.kind.as_deref() == Some("bot") {
            println!("  [Bot] {name}");
        } else {
            println!("  {name}");
        }
        println!("    id: {}", user.id);
        if let Some(email) = user.person.as_ref().and_then(|p| p.email.as_deref()) {
            println!("    email: {email}");
        }
    }
    println!();
    println!(
        "Set NOTION_USER_ID (or notion.user_id in {}) to your own id.",
        config_path().display()
    );
    Ok(ExitCode::SUCCESS)
}

fn fix_urls(config: &Config, dry_run: bool) -> Result<ExitCode, SyncError> {
    config.validate_for_sync()?;
    let remote = NotionClient::new(&config.notion)?;
    let local = OsascriptStore::new();

    let report = sync::fix_urls(config, &remote, &local, dry_run)?;
    for fix in &report.linked {
        println!(
            "link {:?} ({}) -> {}",
            fix.title,
            fix.local_id,
            cross_reference_url(&fix.remote_id)
        );
    }
    for title in &report.unmatched {
        println!("no unique match: {title:?}");
    }
    println!(
        "Linked {} | Unmatched {} | Failed {}",
        report.linked.len(),
        report.unmatched.len(),
        report.failed
    );
    if dry_run {
        println!("DRY RUN: no reminders were changed.");
    }
    if report.failed > 0 {
        Ok(ExitCode::from(2))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}
