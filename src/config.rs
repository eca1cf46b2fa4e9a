// ABOUTME: Strongly typed sync configuration (databases, SSH tunnels, table specs)
// ABOUTME: Loads/saves the JSON config file and merges committed checkpoints into it

use crate::checkpoint::CheckpointUpdate;
use crate::error::SyncError;
use crate::value::{deserialize_optional_checkpoint, Checkpoint};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Root of the config file: `{"databases": {"<name>": {...}}}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub databases: BTreeMap<String, DatabaseTarget>,
    /// Keys this crate does not interpret, kept so a save does not drop them
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Connection parameters for one logical database plus the tables synced from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseTarget {
    #[serde(default = "default_db_host")]
    pub db_host: String,
    #[serde(default = "default_db_port")]
    pub db_port: u16,
    pub db_username: String,
    #[serde(default)]
    pub db_password: String,
    pub db_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_identity_file: Option<PathBuf>,
    #[serde(default)]
    pub tables: Vec<TableSyncSpec>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_db_host() -> String {
    "127.0.0.1".to_string()
}

fn default_db_port() -> u16 {
    3306
}

fn default_ssh_port() -> u16 {
    22
}

fn default_primary_key() -> String {
    "id".to_string()
}

/// SSH jump host used to reach a database that is not directly routable.
#[derive(Clone, PartialEq, Eq)]
pub struct SshTunnelSpec {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub identity_file: Option<PathBuf>,
}

// Hand-written so passwords never reach the logs.
impl fmt::Debug for SshTunnelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshTunnelSpec")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("identity_file", &self.identity_file)
            .finish()
    }
}

impl DatabaseTarget {
    /// Build the SSH tunnel spec from the flat `ssh_*` keys.
    ///
    /// An absent or blank `ssh_host` means the database is reached directly.
    pub fn ssh_tunnel(&self) -> Result<Option<SshTunnelSpec>, SyncError> {
        let host = match self.ssh_host.as_deref().map(str::trim) {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => return Ok(None),
        };

        let username = self
            .ssh_username
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                SyncError::Config(format!("ssh_host '{}' is set but ssh_username is missing", host))
            })?
            .to_string();

        Ok(Some(SshTunnelSpec {
            host,
            port: self.ssh_port.unwrap_or_else(default_ssh_port),
            username,
            password: self.ssh_password.clone().filter(|p| !p.is_empty()),
            identity_file: self.ssh_identity_file.clone(),
        }))
    }
}

/// One sync unit: a source table, how to select from it, and where its CSV goes.
///
/// Several specs may name the same table with different filters and outputs;
/// each carries its own checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSyncSpec {
    pub name: String,
    /// Columns to export, in order (empty = all columns)
    #[serde(default)]
    pub columns: Vec<String>,
    /// Raw SQL predicate AND-ed into every query (empty = no filter)
    #[serde(default, rename = "where")]
    pub filter: String,
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
    #[serde(default)]
    pub incremental: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incremental_column: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_optional_checkpoint",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_id: Option<Checkpoint>,
    /// Output path relative to the output directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TableSyncSpec {
    /// Create a spec with the defaults a freshly discovered table gets.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            columns: Vec::new(),
            filter: String::new(),
            primary_key: default_primary_key(),
            incremental: false,
            incremental_column: None,
            last_id: None,
            output: None,
            last_synced_at: None,
            extra: serde_json::Map::new(),
        }
    }

    /// The `where` filter, if one is configured.
    pub fn filter_clause(&self) -> Option<&str> {
        let trimmed = self.filter.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    }

    /// The incremental column, if one is configured.
    pub fn incremental_column(&self) -> Option<&str> {
        self.incremental_column
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }

    /// Resolve the CSV path: `<output_dir>/<output>` or `<output_dir>/<db>_<table>.csv`.
    pub fn output_path(&self, output_dir: &Path, database: &str) -> PathBuf {
        match self.output.as_deref().map(str::trim) {
            Some(output) if !output.is_empty() => output_dir.join(output),
            _ => output_dir.join(format!("{}_{}.csv", database, self.name)),
        }
    }
}

/// Identifies one table spec within a config snapshot.
///
/// The index disambiguates several specs that name the same physical table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableKey {
    pub database: String,
    pub index: usize,
    pub table: String,
}

impl TableKey {
    pub fn new(database: &str, index: usize, table: &str) -> Self {
        Self {
            database: database.to_string(),
            index,
            table: table.to_string(),
        }
    }

    /// `database.table`, the form used by the `--tables` allow-list
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.database, self.table)
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}#{}", self.database, self.table, self.index)
    }
}

impl SyncConfig {
    /// Load config from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;
        let config: SyncConfig = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config from {:?}", path))?;
        Ok(config)
    }

    /// Save config to a JSON file.
    ///
    /// The file is written to a temporary sibling and renamed into place, so a
    /// crash mid-save leaves the previous config intact.
    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .with_context(|| format!("Failed to create directory {:?}", parent))?;

        let contents =
            serde_json::to_string_pretty(self).context("Failed to serialize config")?;

        let mut tmp = tempfile::NamedTempFile::new_in(&parent)
            .with_context(|| format!("Failed to create temp file in {:?}", parent))?;
        tmp.write_all(contents.as_bytes())
            .context("Failed to write config to temp file")?;
        tmp.write_all(b"\n")
            .context("Failed to write config to temp file")?;
        tmp.as_file()
            .sync_all()
            .context("Failed to sync config temp file")?;
        tmp.persist(path)
            .with_context(|| format!("Failed to replace config at {:?}", path))?;
        Ok(())
    }

    /// Look up a table spec by key, checking the name still matches.
    pub fn table(&self, key: &TableKey) -> Option<&TableSyncSpec> {
        self.databases
            .get(&key.database)
            .and_then(|db| db.tables.get(key.index))
            .filter(|spec| spec.name == key.table)
    }

    /// Merge committed checkpoints into this config.
    ///
    /// Checkpoints only move forward: an update that is not greater than the
    /// stored value is ignored. Returns the number of specs that changed.
    pub fn apply_checkpoints(&mut self, updates: &[CheckpointUpdate]) -> Result<usize, SyncError> {
        let mut applied = 0;
        for update in updates {
            let spec = self
                .databases
                .get_mut(&update.key.database)
                .and_then(|db| db.tables.get_mut(update.key.index))
                .filter(|spec| spec.name == update.key.table)
                .ok_or_else(|| {
                    SyncError::Checkpoint(format!(
                        "table {} no longer exists in config",
                        update.key
                    ))
                })?;

            let advances = match &spec.last_id {
                Some(current) => update.checkpoint.advances(current),
                None => true,
            };
            if advances {
                spec.last_id = Some(update.checkpoint.clone());
                spec.last_synced_at = Some(update.synced_at);
                applied += 1;
            }
        }
        Ok(applied)
    }
}
