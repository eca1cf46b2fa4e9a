// ABOUTME: check command - verifies every configured database is reachable
// ABOUTME: Opens each connection (through its SSH tunnel if any), pings it and lists tables

use crate::config::SyncConfig;
use crate::connection::ConnectionManager;
use crate::error::SyncError;
use anyhow::{bail, Result};
use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Args, Debug, Clone)]
pub struct CheckArgs {
    /// Path to the JSON config describing databases and tables
    #[arg(short, long, env = "MYSQL_CSV_SYNC_CONFIG", default_value = "config.json")]
    pub config: PathBuf,
    /// Only check these databases (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub databases: Option<Vec<String>>,
    /// Seconds allowed for tunnel setup and database connect
    #[arg(long, default_value_t = 30)]
    pub connect_timeout: u64,
}

/// Result of probing one database.
#[derive(Debug)]
pub struct DatabaseCheck {
    pub database: String,
    pub tunneled: bool,
    pub outcome: Result<Vec<String>, SyncError>,
}

impl DatabaseCheck {
    pub fn passed(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Connect to each selected database in `config`.
///
/// Every connection is released before the next database is tried.
pub async fn check_databases(
    config: &SyncConfig,
    connections: &ConnectionManager,
    only: Option<&[String]>,
) -> Vec<DatabaseCheck> {
    let mut checks = Vec::new();

    for (name, target) in &config.databases {
        if let Some(only) = only {
            if !only.iter().any(|db| db == name) {
                continue;
            }
        }

        tracing::info!(
            "Checking {} ({}:{}/{})",
            name,
            target.db_host,
            target.db_port,
            target.db_name
        );

        let mut conn = match connections.acquire(target).await {
            Ok(conn) => conn,
            Err(e) => {
                checks.push(DatabaseCheck {
                    database: name.clone(),
                    tunneled: false,
                    outcome: Err(e),
                });
                continue;
            }
        };

        let tunneled = conn.is_tunneled();
        let outcome = async {
            conn.source().ping().await?;
            conn.source().list_tables().await
        }
        .await;
        conn.release().await;

        checks.push(DatabaseCheck {
            database: name.clone(),
            tunneled,
            outcome,
        });
    }

    checks
}

/// Check connectivity for the configured databases. Returns the exit code.
pub async fn check(args: CheckArgs) -> Result<i32> {
    let config = SyncConfig::load(&args.config)?;

    if let Some(only) = &args.databases {
        for db in only {
            if !config.databases.contains_key(db) {
                bail!("Database '{}' is not in {:?}", db, args.config);
            }
        }
    }

    let connections = ConnectionManager::mysql(Duration::from_secs(args.connect_timeout));
    let checks = check_databases(&config, &connections, args.databases.as_deref()).await;

    println!();
    println!("Connection check");
    println!("================");
    for check in &checks {
        let via = if check.tunneled { " via SSH tunnel" } else { "" };
        match &check.outcome {
            Ok(tables) => {
                println!(
                    "  ✓ {}: connected{}, {} table(s)",
                    check.database,
                    via,
                    tables.len()
                );
                for table in tables {
                    println!("      - {}", table);
                }
            }
            Err(e) => println!("  ✗ {}: {}", check.database, e),
        }
    }
    println!();

    let failed = checks.iter().filter(|c| !c.passed()).count();
    if failed > 0 {
        tracing::error!("{} of {} database(s) unreachable", failed, checks.len());
        Ok(1)
    } else {
        tracing::info!("All {} database(s) reachable", checks.len());
        Ok(0)
    }
}
