// ABOUTME: Command-line entry point for dbsync
// ABOUTME: Parses arguments, sets up logging and signal handling, and dispatches subcommands

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use dbsync::config::{Config, SyncMethod};
use dbsync::display::{format_duration, format_size};
use dbsync::error::SyncError;
use dbsync::inspector::{is_sensitive_name, DatabaseInspector, MySqlInspector, Side};
use dbsync::models::{ConnectionProbe, PlanSummary, SyncPlan, SyncResult};
use dbsync::orchestrator;
use dbsync::process::SystemRunner;
use dbsync::strategy::{build_strategy, StrategyContext};
use dialoguer::{Confirm, Select};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dbsync")]
#[command(about = "Copy a MySQL database from a remote server to a local one")]
#[command(version)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(short, long, global = true, env = "DBSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy a database from the remote server to the local one
    Sync {
        /// Database to copy; prompts with a list when omitted
        database: Option<String>,

        /// Validate and show what would happen without changing anything
        #[arg(long)]
        dry_run: bool,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        force: bool,

        /// Override the number of dump/restore threads
        #[arg(long)]
        threads: Option<u32>,

        /// Dump/restore method
        #[arg(long, value_enum)]
        method: Option<SyncMethod>,

        /// Print the result as JSON on stdout
        #[arg(long)]
        json: bool,
    },

    /// List databases on the remote (or local) server
    List {
        /// List the local server instead
        #[arg(long)]
        local: bool,

        #[arg(long, value_enum, default_value_t = SortOrder::Name)]
        sort: SortOrder,

        #[arg(long)]
        json: bool,
    },

    /// Check connectivity to both servers
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Show the effective configuration with passwords masked
    Config,
}

#[derive(Clone, Copy, ValueEnum)]
enum SortOrder {
    Name,
    Size,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let Cli {
        config: config_path,
        verbose,
        command,
    } = cli;

    match command {
        Commands::Config => {
            let config = Config::resolve(config_path.as_deref())?;
            setup_logging(&config.log.level, verbose);
            print!("{}", render_config(&config)?);
            Ok(())
        }
        Commands::Sync {
            database,
            dry_run,
            force,
            threads,
            method,
            json,
        } => {
            let config = load_config(config_path.as_deref(), verbose)?;
            let options = SyncOptions {
                database,
                dry_run,
                force,
                threads,
                method,
                json,
            };
            sync_command(config, options).await
        }
        Commands::List { local, sort, json } => {
            let config = load_config(config_path.as_deref(), verbose)?;
            list_command(&config, local, sort, json).await
        }
        Commands::Status { json } => {
            let config = load_config(config_path.as_deref(), verbose)?;
            status_command(&config, json).await
        }
    }
}

/// Validated configuration for the commands that connect somewhere
fn load_config(path: Option<&Path>, verbose: u8) -> Result<Config> {
    let config = Config::load(path)?;
    setup_logging(&config.log.level, verbose);
    info!(
        "Remote {} / local {}",
        config.remote.label(),
        config.local.label()
    );
    Ok(config)
}

/// Settings as TOML with passwords masked; an unusable config is still shown
fn render_config(config: &Config) -> Result<String> {
    if let Err(e) = config.validate() {
        warn!("Configuration is not usable yet: {:#}", e);
    }
    toml::to_string_pretty(&config.redacted()).context("Failed to render configuration")
}

/// Level from config, raised by `-v`; `RUST_LOG` wins when set
fn setup_logging(configured: &str, verbose: u8) {
    let level = match verbose {
        0 => configured,
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("dbsync={},warn", level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Cancel the token on Ctrl-C, and on SIGTERM where available
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();

    let token = cancel_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupted. Stopping the running tool and cleaning up...");
            token.cancel();
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let token = cancel_token.clone();
        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    eprintln!("\nReceived SIGTERM. Stopping the running tool and cleaning up...");
                    token.cancel();
                }
                Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
            }
        });
    }

    cancel_token
}

struct SyncOptions {
    database: Option<String>,
    dry_run: bool,
    force: bool,
    threads: Option<u32>,
    method: Option<SyncMethod>,
    json: bool,
}

async fn sync_command(mut config: Config, options: SyncOptions) -> Result<()> {
    if let Some(threads) = options.threads {
        config.dump.threads = threads;
        config.validate()?;
    }
    let method = options.method.unwrap_or(config.dump.method);
    let config = Arc::new(config);
    let inspector = Arc::new(MySqlInspector::new(&config));

    let database = match options.database {
        Some(name) => name,
        None => {
            if options.json || !std::io::stdin().is_terminal() {
                bail!("a database name is required when not running interactively");
            }
            match select_database(inspector.as_ref()).await? {
                Some(name) => name,
                None => {
                    eprintln!("No database selected");
                    return Ok(());
                }
            }
        }
    };

    let show_progress = !options.json && std::io::stderr().is_terminal();
    let ctx = StrategyContext::new(
        config.clone(),
        inspector.clone(),
        inspector.clone(),
        Arc::new(SystemRunner),
    )
    .with_cancel(setup_signal_handler())
    .with_progress(show_progress);
    let strategy = build_strategy(method, ctx);

    if options.dry_run {
        let plan = orchestrator::plan(strategy.as_ref(), &database).await?;
        if options.json {
            println!("{}", serde_json::to_string_pretty(&plan)?);
        } else {
            print_plan(&plan);
        }
        return Ok(());
    }

    if !options.force {
        let summary = orchestrator::plan_summary(strategy.as_ref(), &database).await?;
        print_summary(&summary, method, &config);
        if is_sensitive_name(&database) {
            eprintln!(
                "WARNING: '{}' looks like a production database name. Double-check the target.",
                database
            );
        }
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Replace local '{}' on {}?",
                database,
                config.local.label()
            ))
            .default(false)
            .interact()
            .context("Failed to read confirmation")?;
        if !confirmed {
            eprintln!("Sync cancelled");
            return Ok(());
        }
    }

    let start_time = Utc::now();
    match strategy.execute_sync(&database).await {
        Ok(result) => {
            if options.json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_result(&result, method);
            }
            Ok(())
        }
        Err(e) => {
            if options.json {
                let result = SyncResult::failed(&database, start_time, &e);
                let mut value = serde_json::to_value(&result)?;
                if let Some(kind) = SyncError::find(&e).map(SyncError::kind) {
                    value["error_kind"] = kind.into();
                }
                println!("{}", serde_json::to_string_pretty(&value)?);
            }
            Err(e)
        }
    }
}

/// Interactive picker over remote databases; `None` when the user backs out
async fn select_database(inspector: &dyn DatabaseInspector) -> Result<Option<String>> {
    let databases = inspector.list_databases(Side::Remote).await?;
    if databases.is_empty() {
        bail!("the remote server has no user databases");
    }

    let items: Vec<String> = databases
        .iter()
        .map(|d| {
            format!(
                "{} ({}, {} tables)",
                d.name,
                format_size(d.size_bytes),
                d.table_count
            )
        })
        .collect();
    let choice = Select::new()
        .with_prompt("Select a database to sync")
        .items(&items)
        .default(0)
        .interact_opt()
        .context("Failed to read selection")?;

    Ok(choice.map(|i| databases[i].name.clone()))
}

async fn list_command(config: &Config, local: bool, sort: SortOrder, json: bool) -> Result<()> {
    let side = if local { Side::Local } else { Side::Remote };
    let inspector = MySqlInspector::new(config);
    let mut databases = inspector.list_databases(side).await?;
    match sort {
        SortOrder::Name => databases.sort_by(|a, b| a.name.cmp(&b.name)),
        SortOrder::Size => databases.sort_by(|a, b| b.size_bytes.cmp(&a.size_bytes)),
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&databases)?);
        return Ok(());
    }

    if databases.is_empty() {
        println!("No user databases on the {} server", side);
        return Ok(());
    }
    println!("{:<40} {:>12} {:>8}  {}", "DATABASE", "SIZE", "TABLES", "CREATED");
    for db in &databases {
        let created = db
            .created_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<40} {:>12} {:>8}  {}",
            db.name,
            format_size(db.size_bytes),
            db.table_count,
            created
        );
    }
    Ok(())
}

async fn status_command(config: &Config, json: bool) -> Result<()> {
    let inspector = MySqlInspector::new(config);
    let (remote, local) = tokio::join!(
        inspector.test_connection(Side::Remote),
        inspector.test_connection(Side::Local)
    );

    if json {
        let value = serde_json::json!({ "remote": remote, "local": local });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        print_probe("Remote", &remote);
        print_probe("Local", &local);
    }

    if !remote.connected || !local.connected {
        return Err(SyncError::Connectivity("one or more servers are unreachable".to_string()).into());
    }
    Ok(())
}

fn print_probe(label: &str, probe: &ConnectionProbe) {
    if probe.connected {
        println!(
            "{:<7} {}@{}:{}  connected (MySQL {})",
            label,
            probe.user,
            probe.host,
            probe.port,
            probe.server_version.as_deref().unwrap_or("unknown")
        );
    } else {
        println!(
            "{:<7} {}@{}:{}  unreachable: {}",
            label,
            probe.user,
            probe.host,
            probe.port,
            probe.error.as_deref().unwrap_or("unknown error")
        );
    }
}

fn print_summary(summary: &PlanSummary, method: SyncMethod, config: &Config) {
    eprintln!("Database: {}", summary.database_name);
    eprintln!(
        "Source:   {} ({}, {} tables)",
        config.remote.label(),
        format_size(summary.size_bytes),
        summary.table_count
    );
    eprintln!("Target:   {}", config.local.label());
    eprintln!("Method:   {} ({} threads)", method, config.dump.threads);
    if summary.will_replace_existing {
        eprintln!(
            "The local database '{}' exists and will be dropped and recreated.",
            summary.database_name
        );
    }
}

fn print_plan(plan: &SyncPlan) {
    println!("Dry run: nothing was changed");
    println!("  Database: {}", plan.summary.database_name);
    println!("  Method:   {}", plan.method);
    println!("  Size:     {}", format_size(plan.summary.size_bytes));
    println!("  Tables:   {}", plan.summary.table_count);
    println!(
        "  Local:    {}",
        if plan.summary.will_replace_existing {
            "existing database would be replaced"
        } else {
            "database would be created"
        }
    );
    println!("  Commands:");
    for command in &plan.commands {
        println!("    {}", command);
    }
}

fn print_result(result: &SyncResult, method: SyncMethod) {
    println!("Sync of '{}' completed", result.database_name);
    println!("  Method:  {}", method);
    println!("  Size:    {}", format_size(result.dump_size_bytes));
    println!("  Tables:  {}", result.table_count);
    println!("  Dump:    {}", format_duration(result.dump_duration));
    println!("  Restore: {}", format_duration(result.restore_duration));
    println!("  Total:   {}", format_duration(result.total_duration));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_command_parses_without_other_arguments() {
        let cli = Cli::try_parse_from(["dbsync", "--config", "/tmp/dbsync.toml", "config"]).unwrap();
        assert!(matches!(cli.command, Commands::Config));
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/dbsync.toml")));
    }

    #[test]
    fn test_render_config_shows_invalid_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dbsync.toml");
        std::fs::write(
            &path,
            "[remote]\nhost = \"db.example.com\"\nuser = \"app\"\npassword = \"s3cret-value\"\n[dump]\nthreads = 0\n",
        )
        .unwrap();

        let config = Config::resolve(Some(&path)).unwrap();
        assert!(Config::load(Some(&path)).is_err());

        let rendered = render_config(&config).unwrap();
        assert!(rendered.contains("db.example.com"));
        assert!(!rendered.contains("s3cret-value"));
    }
}
