// ABOUTME: In-memory fakes for the connection seams used by integration tests
// ABOUTME: Evaluates planned queries against fixture rows and counts tunnel lifecycle events

#![allow(dead_code)]

use async_trait::async_trait;
use mysql_csv_sync::checkpoint::{CheckpointStore, CheckpointUpdate};
use mysql_csv_sync::config::{DatabaseTarget, SshTunnelSpec, SyncConfig};
use mysql_csv_sync::connection::{ConnectionManager, Driver, Endpoint, Source, Tunnel, TunnelOpener};
use mysql_csv_sync::error::SyncError;
use mysql_csv_sync::planner::QuerySpec;
use mysql_csv_sync::value::{Checkpoint, SqlValue};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

pub type Row = Vec<SqlValue>;
pub type Predicate = Arc<dyn Fn(&HashMap<String, SqlValue>) -> bool + Send + Sync>;

/// One table of fixture rows.
#[derive(Clone, Default)]
pub struct FakeTable {
    pub columns: Vec<String>,
    pub primary_key: Vec<String>,
    pub rows: Vec<Row>,
}

impl FakeTable {
    pub fn new(columns: &[&str], primary_key: &str) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            primary_key: vec![primary_key.to_string()],
            rows: Vec::new(),
        }
    }

    pub fn with_rows(mut self, rows: Vec<Row>) -> Self {
        self.rows = rows;
        self
    }

    fn as_map(&self, row: &Row) -> HashMap<String, SqlValue> {
        self.columns
            .iter()
            .cloned()
            .zip(row.iter().cloned())
            .collect()
    }
}

/// Fixture state for one database, shared by every connection to it.
#[derive(Default)]
pub struct FakeDatabase {
    pub tables: HashMap<String, FakeTable>,
    /// `where` strings the fake understands, mapped to row predicates
    pub filters: HashMap<String, Predicate>,
    /// Forces the validation count to this value
    pub count_override: Option<u64>,
    /// Fails the Nth `fetch_page` call (1-based, counted per database)
    pub fail_fetch_on_call: Option<usize>,
    /// Cancels the token after the Nth `fetch_page` call
    pub cancel_after_call: Option<(usize, CancellationToken)>,
    pub fetch_calls: usize,
    pub count_calls: usize,
}

impl FakeDatabase {
    pub fn with_table(mut self, name: &str, table: FakeTable) -> Self {
        self.tables.insert(name.to_string(), table);
        self
    }

    pub fn with_filter(
        mut self,
        sql: &str,
        predicate: impl Fn(&HashMap<String, SqlValue>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.filters.insert(sql.to_string(), Arc::new(predicate));
        self
    }

    fn table(&self, name: &str) -> Result<&FakeTable, SyncError> {
        self.tables
            .get(name)
            .ok_or_else(|| SyncError::Fetch(format!("table '{}' not found", name)))
    }

    /// Rows matching the query's predicate, sorted by its ordering columns.
    fn matching(
        &self,
        query: &QuerySpec,
        cursor: Option<&[SqlValue]>,
    ) -> Result<Vec<HashMap<String, SqlValue>>, SyncError> {
        let table = self.table(&query.table)?;
        let filter = match &query.filter {
            Some(sql) => Some(
                self.filters
                    .get(sql)
                    .cloned()
                    .ok_or_else(|| SyncError::Fetch(format!("unsupported where: {}", sql)))?,
            ),
            None => None,
        };

        let mut rows: Vec<_> = table
            .rows
            .iter()
            .map(|row| table.as_map(row))
            .filter(|row| filter.as_ref().map(|f| f(row)).unwrap_or(true))
            .filter(|row| match &query.incremental_column {
                Some(col) => {
                    let value = &row[col];
                    match &query.since {
                        Some(since) => {
                            value.compare(&coerce_bound(value, since)) == Some(Ordering::Greater)
                        }
                        None => *value != SqlValue::Null,
                    }
                }
                None => true,
            })
            .collect();

        let key = |row: &HashMap<String, SqlValue>| -> Vec<SqlValue> {
            query.order_by.iter().map(|c| row[c].clone()).collect()
        };
        rows.sort_by(|a, b| tuple_cmp(&key(a), &key(b)));

        if let Some(cursor) = cursor {
            rows.retain(|row| tuple_cmp(&key(row), cursor) == Ordering::Greater);
        }
        Ok(rows)
    }
}

/// Bound for `col > ?` as MySQL sees it: a string compared against an integer
/// column is read as its leading integer, or 0 when it has none.
fn coerce_bound(value: &SqlValue, since: &Checkpoint) -> SqlValue {
    match (value, since) {
        (SqlValue::Int(_) | SqlValue::UInt(_), Checkpoint::Text(s)) => {
            let s = s.trim();
            let digits: String = s
                .char_indices()
                .take_while(|(i, c)| c.is_ascii_digit() || (*i == 0 && *c == '-'))
                .map(|(_, c)| c)
                .collect();
            SqlValue::Int(digits.parse().unwrap_or(0))
        }
        _ => SqlValue::from(since),
    }
}

fn tuple_cmp(a: &[SqlValue], b: &[SqlValue]) -> Ordering {
    for (x, y) in a.iter().zip(b) {
        match x.compare(y).unwrap_or(Ordering::Equal) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

pub type SharedDatabases = Arc<Mutex<HashMap<String, FakeDatabase>>>;

/// Driver that connects to in-memory databases keyed by `db_name`.
#[derive(Default)]
pub struct FakeDriver {
    pub databases: SharedDatabases,
    pub connects: AtomicUsize,
    pub disconnects: Arc<AtomicUsize>,
    pub endpoints: Mutex<Vec<Endpoint>>,
    /// Databases whose connect always fails
    pub unreachable: Mutex<Vec<String>>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_database(&self, name: &str, db: FakeDatabase) {
        self.databases
            .lock()
            .unwrap()
            .insert(name.to_string(), db);
    }

    pub fn make_unreachable(&self, name: &str) {
        self.unreachable.lock().unwrap().push(name.to_string());
    }

    pub fn with_database<R>(&self, name: &str, f: impl FnOnce(&mut FakeDatabase) -> R) -> R {
        let mut dbs = self.databases.lock().unwrap();
        f(dbs.get_mut(name).expect("fake database exists"))
    }

    pub fn connects(&self) -> usize {
        self.connects.load(AtomicOrdering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(AtomicOrdering::SeqCst)
    }
}

#[async_trait]
impl Driver for FakeDriver {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        target: &DatabaseTarget,
    ) -> Result<Box<dyn Source>, SyncError> {
        self.connects.fetch_add(1, AtomicOrdering::SeqCst);
        self.endpoints.lock().unwrap().push(endpoint.clone());

        if self.unreachable.lock().unwrap().contains(&target.db_name) {
            return Err(SyncError::database(format!(
                "can't connect to {}:{}",
                endpoint.host, endpoint.port
            )));
        }
        if !self.databases.lock().unwrap().contains_key(&target.db_name) {
            return Err(SyncError::database(format!(
                "unknown database '{}'",
                target.db_name
            )));
        }

        Ok(Box::new(FakeSource {
            database: target.db_name.clone(),
            databases: self.databases.clone(),
            disconnects: self.disconnects.clone(),
        }))
    }
}

pub struct FakeSource {
    database: String,
    databases: SharedDatabases,
    disconnects: Arc<AtomicUsize>,
}

impl FakeSource {
    fn with_db<R>(
        &self,
        f: impl FnOnce(&mut FakeDatabase) -> Result<R, SyncError>,
    ) -> Result<R, SyncError> {
        let mut dbs = self.databases.lock().unwrap();
        let db = dbs
            .get_mut(&self.database)
            .ok_or_else(|| SyncError::database("database dropped"))?;
        f(db)
    }
}

#[async_trait]
impl Source for FakeSource {
    async fn describe(&mut self, table: &str) -> Result<Vec<String>, SyncError> {
        self.with_db(|db| Ok(db.table(table)?.columns.clone()))
    }

    async fn fetch_page(
        &mut self,
        query: &QuerySpec,
        cursor: Option<&[SqlValue]>,
        limit: usize,
    ) -> Result<Vec<Vec<SqlValue>>, SyncError> {
        self.with_db(|db| {
            db.fetch_calls += 1;
            if db.fail_fetch_on_call == Some(db.fetch_calls) {
                return Err(SyncError::Fetch("Lost connection to MySQL server".into()));
            }
            if let Some((after, token)) = &db.cancel_after_call {
                if db.fetch_calls >= *after {
                    token.cancel();
                }
            }

            let columns = query.fetch_columns();
            let rows = db.matching(query, cursor)?;
            Ok(rows
                .into_iter()
                .take(limit)
                .map(|row| columns.iter().map(|c| row[c].clone()).collect())
                .collect())
        })
    }

    async fn count(&mut self, query: &QuerySpec) -> Result<u64, SyncError> {
        self.with_db(|db| {
            db.count_calls += 1;
            if let Some(count) = db.count_override {
                return Ok(count);
            }
            Ok(db.matching(query, None)?.len() as u64)
        })
    }

    async fn list_tables(&mut self) -> Result<Vec<String>, SyncError> {
        self.with_db(|db| {
            let mut names: Vec<String> = db.tables.keys().cloned().collect();
            names.sort();
            Ok(names)
        })
    }

    async fn primary_key(&mut self, table: &str) -> Result<Vec<String>, SyncError> {
        self.with_db(|db| Ok(db.table(table)?.primary_key.clone()))
    }

    async fn ping(&mut self) -> Result<(), SyncError> {
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), SyncError> {
        self.disconnects.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(())
    }
}

/// Tunnel opener that hands out fake forwards and counts teardowns.
#[derive(Default)]
pub struct FakeTunnels {
    pub opens: AtomicUsize,
    pub closes: Arc<AtomicUsize>,
    pub fail: bool,
}

impl FakeTunnels {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(AtomicOrdering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(AtomicOrdering::SeqCst)
    }
}

#[async_trait]
impl TunnelOpener for FakeTunnels {
    async fn open(
        &self,
        spec: &SshTunnelSpec,
        _remote_host: &str,
        _remote_port: u16,
    ) -> Result<Box<dyn Tunnel>, SyncError> {
        if self.fail {
            return Err(SyncError::tunnel(format!(
                "ssh: connect to host {} port {}: Connection refused",
                spec.host, spec.port
            )));
        }
        let n = self.opens.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(Box::new(FakeTunnel {
            local_port: 40000 + n as u16,
            closes: self.closes.clone(),
        }))
    }
}

struct FakeTunnel {
    local_port: u16,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl Tunnel for FakeTunnel {
    fn local_port(&self) -> u16 {
        self.local_port
    }

    async fn close(self: Box<Self>) -> Result<(), SyncError> {
        self.closes.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(())
    }
}

/// Store that records every commit in memory.
#[derive(Default)]
pub struct MemoryStore {
    pub commits: Mutex<Vec<Vec<CheckpointUpdate>>>,
}

impl CheckpointStore for MemoryStore {
    fn commit(&self, updates: &[CheckpointUpdate]) -> Result<usize, SyncError> {
        self.commits.lock().unwrap().push(updates.to_vec());
        Ok(updates.len())
    }
}

pub fn manager(tunnels: Arc<FakeTunnels>, driver: Arc<FakeDriver>) -> ConnectionManager {
    ConnectionManager::new(tunnels, driver)
}

/// `orders(id, status, total)` with one row per id.
pub fn orders_table(ids: std::ops::RangeInclusive<i64>) -> FakeTable {
    FakeTable::new(&["id", "status", "total"], "id").with_rows(
        ids.map(|id| {
            vec![
                SqlValue::Int(id),
                SqlValue::Text(if id % 3 == 0 { "cancelled" } else { "active" }.to_string()),
                SqlValue::Text(format!("{}.{:02}", id * 3, id % 100)),
            ]
        })
        .collect(),
    )
}

/// Write a config to `dir/config.json` and return its path.
pub fn write_config(dir: &Path, config: serde_json::Value) -> PathBuf {
    let path = dir.join("config.json");
    std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();
    path
}

pub fn load_config(path: &Path) -> SyncConfig {
    SyncConfig::load(path).unwrap()
}
