// ABOUTME: CLI entry point for mysql-csv-sync
// ABOUTME: Parses commands, sets up logging and routes to the command handlers

use clap::{Parser, Subcommand};
use mysql_csv_sync::commands;
use mysql_csv_sync::commands::check::CheckArgs;
use mysql_csv_sync::commands::discover::DiscoverArgs;
use mysql_csv_sync::commands::sync::SyncArgs;

#[derive(Parser)]
#[command(name = "mysql-csv-sync")]
#[command(about = "Incrementally export MySQL tables to CSV files", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Shorthand for --log debug
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync every configured table (or a selection) to CSV
    ///
    /// Full tables are rewritten from scratch. Incremental tables append rows
    /// past their stored checkpoint, which is advanced in the config file once
    /// the rows are written and validated against the source.
    Sync(SyncArgs),
    /// Check that every configured database is reachable
    Check(CheckArgs),
    /// Generate table specs from a live database and add them to the config
    Discover(DiscoverArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    // 1. RUST_LOG environment variable has highest precedence
    // 2. --log flag (or -v) is used if RUST_LOG is not set
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        cli.log.clone()
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let code = match cli.command {
        Commands::Sync(args) => commands::sync(args).await?,
        Commands::Check(args) => commands::check(args).await?,
        Commands::Discover(args) => commands::discover(args).await?,
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
