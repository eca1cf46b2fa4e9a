// ABOUTME: sync command - runs one sync pass over every selected table in the config
// ABOUTME: Wires CLI flags into SyncOptions, handles Ctrl+C and derives the exit code

use crate::checkpoint::JsonConfigStore;
use crate::config::SyncConfig;
use crate::connection::ConnectionManager;
use crate::filters::SelectionFilter;
use crate::orchestrator::{SyncOptions, SyncOrchestrator};
use anyhow::Result;
use clap::Args;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Args, Debug, Clone)]
pub struct SyncArgs {
    /// Path to the JSON config describing databases and tables
    #[arg(short, long, env = "MYSQL_CSV_SYNC_CONFIG", default_value = "config.json")]
    pub config: PathBuf,
    /// Directory CSV outputs are written under
    #[arg(
        short = 'o',
        long = "output-path",
        env = "MYSQL_CSV_SYNC_OUTPUT",
        default_value = "output"
    )]
    pub output_path: PathBuf,
    /// Rows fetched and written per batch
    #[arg(short, long, default_value_t = 1000, value_parser = parse_positive)]
    pub batch_size: usize,
    /// Only sync these tables (format: database.table, comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub tables: Option<Vec<String>>,
    /// Only sync tables configured as incremental
    #[arg(long)]
    pub incremental_only: bool,
    /// Skip tables configured as incremental
    #[arg(long)]
    pub skip_incremental: bool,
    /// Treat validation mismatches as warnings and advance checkpoints anyway
    #[arg(long)]
    pub skip_validation: bool,
    /// Number of tables synced at the same time
    #[arg(long, default_value_t = 1, value_parser = parse_positive)]
    pub concurrency: usize,
    /// Connection retries before a table is marked failed
    #[arg(long, default_value_t = 3)]
    pub max_retries: u32,
    /// Seconds allowed for tunnel setup and database connect
    #[arg(long, default_value_t = 30)]
    pub connect_timeout: u64,
    /// Seconds allowed per query (0 disables the limit)
    #[arg(long, default_value_t = 300)]
    pub query_timeout: u64,
    /// Show a progress spinner per table
    #[arg(long)]
    pub progress: bool,
}

impl SyncArgs {
    pub fn options(&self) -> SyncOptions {
        SyncOptions {
            batch_size: self.batch_size,
            concurrency: self.concurrency,
            skip_validation: self.skip_validation,
            output_dir: self.output_path.clone(),
            max_retries: self.max_retries,
            query_timeout: (self.query_timeout > 0)
                .then(|| Duration::from_secs(self.query_timeout)),
            show_progress: self.progress,
            ..SyncOptions::default()
        }
    }
}

fn parse_positive(s: &str) -> std::result::Result<usize, String> {
    match s.parse::<usize>() {
        Ok(0) => Err("must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

/// Run one sync pass. Returns the process exit code.
pub async fn sync(args: SyncArgs) -> Result<i32> {
    let filter = SelectionFilter::new(
        args.tables.clone(),
        args.incremental_only,
        args.skip_incremental,
    )?;

    let config = SyncConfig::load(&args.config)?;
    if !filter.is_empty() {
        tracing::info!("Table selection: {:?}", filter);
        warn_unknown_tables(&config, &filter);
    }

    tracing::info!(
        "Loaded {} database(s) from {}",
        config.databases.len(),
        args.config.display()
    );

    let connections = ConnectionManager::mysql(Duration::from_secs(args.connect_timeout));
    let orchestrator = SyncOrchestrator::new(connections, args.options(), filter);

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::warn!("Received shutdown signal, stopping after the current batch");
                signal_token.cancel();
            }
            Err(e) => tracing::warn!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    let store = JsonConfigStore::new(&args.config);
    let report = orchestrator.run(&config, &cancel, &store).await;
    report.log_summary();

    if let Some(e) = &report.commit_error {
        tracing::error!(
            "Checkpoints were not saved to {}; the next run will repeat this pass",
            store.path().display()
        );
        tracing::debug!("Commit error: {:?}", e);
    }

    Ok(report.exit_code())
}

fn warn_unknown_tables(config: &SyncConfig, filter: &SelectionFilter) {
    let Some(tables) = filter.tables() else {
        return;
    };
    for wanted in tables {
        let known = config.databases.iter().any(|(db, target)| {
            target
                .tables
                .iter()
                .any(|spec| format!("{}.{}", db, spec.name) == *wanted)
        });
        if !known {
            tracing::warn!("⚠ {} is not in the config and will be ignored", wanted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        args: SyncArgs,
    }

    #[test]
    fn test_defaults_map_to_options() {
        let cli = TestCli::try_parse_from(["test", "-c", "cfg.json"]).unwrap();
        let options = cli.args.options();
        assert_eq!(options.batch_size, 1000);
        assert_eq!(options.concurrency, 1);
        assert_eq!(options.output_dir, PathBuf::from("output"));
        assert_eq!(options.query_timeout, Some(Duration::from_secs(300)));
        assert!(!options.skip_validation);
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        assert!(TestCli::try_parse_from(["test", "-b", "0"]).is_err());
    }

    #[test]
    fn test_query_timeout_zero_disables_limit() {
        let cli = TestCli::try_parse_from(["test", "--query-timeout", "0", "--tables", "shop.orders,shop.users"])
            .unwrap();
        assert_eq!(cli.args.options().query_timeout, None);
        assert_eq!(
            cli.args.tables,
            Some(vec!["shop.orders".to_string(), "shop.users".to_string()])
        );
    }
}
