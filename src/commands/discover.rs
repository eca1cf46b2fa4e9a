// ABOUTME: discover command - generates table specs from a live database
// ABOUTME: Lists base tables, detects primary keys and merges specs into the config file

use crate::config::{SyncConfig, TableSyncSpec};
use crate::connection::{ConnectionManager, Source};
use crate::error::SyncError;
use crate::value::Checkpoint;
use anyhow::{bail, Context, Result};
use clap::{Args, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

/// How discovered specs are merged into an existing table list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DiscoverMode {
    /// Keep existing specs and add tables not yet listed
    Append,
    /// Replace the table list with the discovered specs
    Overwrite,
}

#[derive(Args, Debug, Clone)]
pub struct DiscoverArgs {
    /// Path to the JSON config describing databases and tables
    #[arg(short, long, env = "MYSQL_CSV_SYNC_CONFIG", default_value = "config.json")]
    pub config: PathBuf,
    /// Only discover tables of this database (default: all configured databases)
    #[arg(long)]
    pub database: Option<String>,
    /// Append new tables or overwrite the existing table list
    #[arg(long, value_enum, default_value = "append")]
    pub mode: DiscoverMode,
    /// Print the resulting config instead of saving it
    #[arg(long)]
    pub dry_run: bool,
    /// Seconds allowed for tunnel setup and database connect
    #[arg(long, default_value_t = 30)]
    pub connect_timeout: u64,
}

/// Build a default spec for every base table in the connected database.
///
/// Tables without a primary key fall back to `id` and are logged, since keyset
/// pagination needs a unique ordering column.
pub async fn discover_tables(
    source: &mut dyn Source,
    database: &str,
) -> Result<Vec<TableSyncSpec>, SyncError> {
    let tables = source.list_tables().await?;
    let mut specs = Vec::with_capacity(tables.len());

    for table in tables {
        let primary_key = source.primary_key(&table).await?;
        let mut spec = TableSyncSpec::new(&table);
        match primary_key.as_slice() {
            [single] => spec.primary_key = single.clone(),
            [] => tracing::warn!(
                "⚠ {}.{} has no primary key; edit primary_key before syncing it",
                database,
                table
            ),
            [first, ..] => {
                tracing::warn!(
                    "⚠ {}.{} has a composite primary key; using {} for ordering",
                    database,
                    table,
                    first
                );
                spec.primary_key = first.clone();
            }
        }
        spec.incremental_column = Some(spec.primary_key.clone());
        spec.last_id = Some(Checkpoint::Int(0));
        spec.output = Some(format!("{}/{}.csv", database, table));
        specs.push(spec);
    }

    Ok(specs)
}

/// Merge discovered specs into `existing`. Returns how many specs were added.
pub fn merge_specs(
    existing: &mut Vec<TableSyncSpec>,
    discovered: Vec<TableSyncSpec>,
    mode: DiscoverMode,
) -> usize {
    match mode {
        DiscoverMode::Overwrite => {
            let added = discovered.len();
            *existing = discovered;
            added
        }
        DiscoverMode::Append => {
            let mut added = 0;
            for spec in discovered {
                if !existing.iter().any(|s| s.name == spec.name) {
                    existing.push(spec);
                    added += 1;
                }
            }
            added
        }
    }
}

/// Discover tables and write them into the config. Returns the exit code.
pub async fn discover(args: DiscoverArgs) -> Result<i32> {
    let mut config = SyncConfig::load(&args.config)?;

    let names: Vec<String> = match &args.database {
        Some(db) => {
            if !config.databases.contains_key(db) {
                bail!("Database '{}' is not in {:?}", db, args.config);
            }
            vec![db.clone()]
        }
        None => config.databases.keys().cloned().collect(),
    };

    let connections = ConnectionManager::mysql(Duration::from_secs(args.connect_timeout));
    let mut failures = 0;

    for name in names {
        let Some(target) = config.databases.get(&name) else {
            continue;
        };

        let mut conn = match connections.acquire(target).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::error!("✗ {}: {}", name, e);
                failures += 1;
                continue;
            }
        };
        let discovered = discover_tables(conn.source(), &name).await;
        conn.release().await;

        let discovered = match discovered {
            Ok(specs) => specs,
            Err(e) => {
                tracing::error!("✗ {}: {}", name, e);
                failures += 1;
                continue;
            }
        };

        let found = discovered.len();
        if let Some(target) = config.databases.get_mut(&name) {
            let added = merge_specs(&mut target.tables, discovered, args.mode);
            tracing::info!(
                "✓ {}: found {} table(s), {} added ({:?} mode)",
                name,
                found,
                added,
                args.mode
            );
        }
    }

    if args.dry_run {
        let rendered =
            serde_json::to_string_pretty(&config).context("Failed to serialize config")?;
        println!("{}", rendered);
    } else {
        config.save(&args.config)?;
        tracing::info!("Saved config to {}", args.config.display());
    }

    Ok(if failures > 0 { 1 } else { 0 })
}
