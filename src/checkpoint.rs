// ABOUTME: Per-run checkpoint snapshot and the collected list of checkpoint advances
// ABOUTME: Commits all advances in one step through a pluggable persistence store

use crate::config::{SyncConfig, TableKey};
use crate::error::SyncError;
use crate::value::Checkpoint;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// A validated checkpoint advance for one table spec.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointUpdate {
    pub key: TableKey,
    pub checkpoint: Checkpoint,
    pub synced_at: DateTime<Utc>,
}

impl CheckpointUpdate {
    pub fn new(key: TableKey, checkpoint: Checkpoint) -> Self {
        Self {
            key,
            checkpoint,
            synced_at: Utc::now(),
        }
    }
}

/// Persistence collaborator for committed checkpoints.
pub trait CheckpointStore: Send + Sync {
    /// Persist all updates at once. Returns how many specs actually changed.
    fn commit(&self, updates: &[CheckpointUpdate]) -> Result<usize, SyncError>;
}

/// Stores checkpoints back into the JSON config file they were read from.
///
/// The file is re-read at commit time so edits made to other keys while the
/// run was in progress are not clobbered.
pub struct JsonConfigStore {
    path: PathBuf,
}

impl JsonConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CheckpointStore for JsonConfigStore {
    fn commit(&self, updates: &[CheckpointUpdate]) -> Result<usize, SyncError> {
        let mut config = SyncConfig::load(&self.path)
            .map_err(|e| SyncError::Checkpoint(format!("{:#}", e)))?;
        let applied = config.apply_checkpoints(updates)?;
        if applied > 0 {
            config
                .save(&self.path)
                .map_err(|e| SyncError::Checkpoint(format!("{:#}", e)))?;
        }
        Ok(applied)
    }
}

/// Holds the checkpoint snapshot taken at the start of a run and the advances
/// collected from finished table pipelines.
///
/// The snapshot is never mutated; pipelines each get their own copy of their
/// starting checkpoint and hand back a proposed advance.
#[derive(Debug, Default)]
pub struct CheckpointTracker {
    snapshot: HashMap<TableKey, Option<Checkpoint>>,
    updates: Vec<CheckpointUpdate>,
}

impl CheckpointTracker {
    /// Snapshot every table's checkpoint from the config.
    pub fn from_config(config: &SyncConfig) -> Self {
        let mut snapshot = HashMap::new();
        for (db_name, db) in &config.databases {
            for (index, spec) in db.tables.iter().enumerate() {
                snapshot.insert(
                    TableKey::new(db_name, index, &spec.name),
                    spec.last_id.clone(),
                );
            }
        }
        Self {
            snapshot,
            updates: Vec::new(),
        }
    }

    /// Checkpoint a table started this run with.
    pub fn starting_checkpoint(&self, key: &TableKey) -> Option<&Checkpoint> {
        self.snapshot.get(key).and_then(|c| c.as_ref())
    }

    /// Record a proposed advance.
    ///
    /// Returns false (and records nothing) if the value does not move the
    /// checkpoint forward.
    pub fn record(&mut self, key: TableKey, checkpoint: Checkpoint) -> bool {
        let advances = match self.starting_checkpoint(&key) {
            Some(current) => checkpoint.advances(current),
            None => true,
        };
        if advances {
            self.updates.retain(|u| u.key != key);
            self.updates.push(CheckpointUpdate::new(key, checkpoint));
        }
        advances
    }

    /// Persist all collected advances in a single store call.
    pub fn commit(self, store: &dyn CheckpointStore) -> Result<Vec<CheckpointUpdate>, SyncError> {
        if self.updates.is_empty() {
            tracing::debug!("No checkpoint advances to commit");
            return Ok(self.updates);
        }

        let applied = store.commit(&self.updates)?;
        tracing::info!(
            "Committed {} checkpoint update(s) ({} changed)",
            self.updates.len(),
            applied
        );
        Ok(self.updates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct RecordingStore {
        calls: Mutex<Vec<Vec<CheckpointUpdate>>>,
    }

    impl CheckpointStore for RecordingStore {
        fn commit(&self, updates: &[CheckpointUpdate]) -> Result<usize, SyncError> {
            self.calls.lock().unwrap().push(updates.to_vec());
            Ok(updates.len())
        }
    }

    fn config_with_orders(last_id: Option<i64>) -> SyncConfig {
        let last = last_id
            .map(|v| format!(r#", "last_id": {}"#, v))
            .unwrap_or_default();
        let json = format!(
            r#"{{"databases": {{"shop": {{"db_username": "u", "db_name": "shop",
                "tables": [{{"name": "orders", "incremental": true, "incremental_column": "id"{}}}]}}}}}}"#,
            last
        );
        serde_json::from_str(&json).unwrap()
    }

    #[test]
    fn test_record_only_accepts_forward_moves() {
        let config = config_with_orders(Some(100));
        let mut tracker = CheckpointTracker::from_config(&config);
        let key = TableKey::new("shop", 0, "orders");

        assert_eq!(tracker.starting_checkpoint(&key), Some(&Checkpoint::Int(100)));
        assert!(!tracker.record(key.clone(), Checkpoint::Int(100)));
        assert!(!tracker.record(key.clone(), Checkpoint::Int(99)));

        assert!(tracker.record(key.clone(), Checkpoint::Int(150)));
        let store = RecordingStore::default();
        let committed = tracker.commit(&store).unwrap();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].checkpoint, Checkpoint::Int(150));
    }

    #[test]
    fn test_record_accepts_integer_past_numeric_string() {
        let json = r#"{"databases": {"shop": {"db_username": "u", "db_name": "shop",
            "tables": [{"name": "orders", "incremental": true, "incremental_column": "id",
                        "last_id": "100"}]}}}"#;
        let config: SyncConfig = serde_json::from_str(json).unwrap();
        let mut tracker = CheckpointTracker::from_config(&config);
        let key = TableKey::new("shop", 0, "orders");

        assert!(!tracker.record(key.clone(), Checkpoint::Int(100)));
        assert!(tracker.record(key, Checkpoint::Int(150)));
    }

    #[test]
    fn test_commit_is_one_store_call() {
        let config = config_with_orders(None);
        let mut tracker = CheckpointTracker::from_config(&config);
        tracker.record(TableKey::new("shop", 0, "orders"), Checkpoint::Int(10));

        let store = RecordingStore::default();
        let committed = tracker.commit(&store).unwrap();
        assert_eq!(committed.len(), 1);
        assert_eq!(store.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_commit_without_updates_skips_store() {
        let tracker = CheckpointTracker::from_config(&config_with_orders(Some(5)));
        let store = RecordingStore::default();
        tracker.commit(&store).unwrap();
        assert!(store.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_json_store_writes_config_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        config_with_orders(Some(100)).save(&path).unwrap();

        let store = JsonConfigStore::new(&path);
        let update = CheckpointUpdate::new(TableKey::new("shop", 0, "orders"), Checkpoint::Int(150));
        assert_eq!(store.commit(&[update]).unwrap(), 1);

        let reloaded = SyncConfig::load(&path).unwrap();
        assert_eq!(
            reloaded.databases["shop"].tables[0].last_id,
            Some(Checkpoint::Int(150))
        );
    }
}
