// ABOUTME: SyncOrchestrator - runs every selected table through plan, fetch, write and validate
// ABOUTME: Isolates per-table failures and commits all checkpoint advances once at the end

use crate::checkpoint::{CheckpointStore, CheckpointTracker, CheckpointUpdate};
use crate::config::{DatabaseTarget, SyncConfig, TableKey, TableSyncSpec};
use crate::connection::{ConnectionManager, ScopedConnection};
use crate::error::{Severity, SyncError};
use crate::fetcher::BatchFetcher;
use crate::filters::SelectionFilter;
use crate::planner::{plan, QuerySpec, SyncMode};
use crate::sink::{last_checkpoint, CsvSink};
use crate::utils::{retry_with_backoff, sanitize_identifier, with_timeout};
use crate::validation::{Validation, ValidationEngine};
use crate::value::Checkpoint;
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Run-wide settings for the orchestrator.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Maximum rows per fetched page and per CSV write
    pub batch_size: usize,
    /// Table pipelines allowed in flight at once
    pub concurrency: usize,
    /// Downgrade validation mismatches to warnings and advance checkpoints anyway
    pub skip_validation: bool,
    /// Directory each spec's `output` path is resolved against
    pub output_dir: PathBuf,
    /// Connection attempts after the first one fails
    pub max_retries: u32,
    /// Delay before the first connection retry; doubles on each retry
    pub retry_delay: Duration,
    /// Limit on a single query (page fetch, describe, count)
    pub query_timeout: Option<Duration>,
    /// Draw a progress spinner per table
    pub show_progress: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            concurrency: 1,
            skip_validation: false,
            output_dir: PathBuf::from("output"),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            query_timeout: Some(Duration::from_secs(300)),
            show_progress: false,
        }
    }
}

/// Where a table is in its pipeline. The last state reached is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableState {
    Pending,
    Connecting,
    Syncing,
    Validating,
    /// Rows written and validated; the checkpoint advance was handed to the commit
    Committed,
    Failed,
    /// Not run: filtered out or rejected while planning
    Skipped,
    /// Rows written but the source count disagreed
    Mismatched,
}

impl std::fmt::Display for TableState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TableState::Pending => "pending",
            TableState::Connecting => "connecting",
            TableState::Syncing => "syncing",
            TableState::Validating => "validating",
            TableState::Committed => "committed",
            TableState::Failed => "failed",
            TableState::Skipped => "skipped",
            TableState::Mismatched => "mismatched",
        };
        write!(f, "{}", name)
    }
}

/// Outcome of one table spec in one run.
#[derive(Debug)]
pub struct SyncResult {
    pub key: TableKey,
    pub state: TableState,
    pub mode: Option<SyncMode>,
    pub output: Option<PathBuf>,
    pub rows_written: u64,
    pub bytes_written: u64,
    pub validation: Option<Validation>,
    pub error: Option<SyncError>,
    pub previous_checkpoint: Option<Checkpoint>,
    /// Proposed checkpoint; only persisted if the final commit succeeds
    pub new_checkpoint: Option<Checkpoint>,
    pub duration: Duration,
    pub fetch_time: Duration,
    pub write_time: Duration,
}

impl SyncResult {
    fn new(key: TableKey, previous_checkpoint: Option<Checkpoint>) -> Self {
        Self {
            key,
            state: TableState::Pending,
            mode: None,
            output: None,
            rows_written: 0,
            bytes_written: 0,
            validation: None,
            error: None,
            previous_checkpoint,
            new_checkpoint: None,
            duration: Duration::ZERO,
            fetch_time: Duration::ZERO,
            write_time: Duration::ZERO,
        }
    }

    fn fail(&mut self, error: SyncError) {
        self.state = TableState::Failed;
        self.new_checkpoint = None;
        self.error = Some(error);
    }

    pub fn severity(&self, skip_validation: bool) -> Severity {
        match &self.error {
            Some(e) => e.severity(skip_validation),
            None => Severity::Ok,
        }
    }

    /// Checkpoint the table will have after this run's commit.
    pub fn effective_checkpoint(&self) -> Option<&Checkpoint> {
        self.new_checkpoint
            .as_ref()
            .or(self.previous_checkpoint.as_ref())
    }
}

/// Everything one run produced.
#[derive(Debug)]
pub struct RunReport {
    pub results: Vec<SyncResult>,
    pub committed: Vec<CheckpointUpdate>,
    pub commit_error: Option<SyncError>,
    pub skip_validation: bool,
    pub duration: Duration,
}

impl RunReport {
    /// Worst severity across all tables and the checkpoint commit.
    pub fn severity(&self) -> Severity {
        let tables = self
            .results
            .iter()
            .map(|r| r.severity(self.skip_validation))
            .max()
            .unwrap_or(Severity::Ok);
        if self.commit_error.is_some() {
            Severity::Error
        } else {
            tables
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self.severity() {
            Severity::Ok | Severity::Warning => 0,
            Severity::Error => 1,
        }
    }

    pub fn count(&self, state: TableState) -> usize {
        self.results.iter().filter(|r| r.state == state).count()
    }

    pub fn result(&self, key: &TableKey) -> Option<&SyncResult> {
        self.results.iter().find(|r| &r.key == key)
    }

    pub fn rows_written(&self) -> u64 {
        self.results.iter().map(|r| r.rows_written).sum()
    }

    /// Log one line per table followed by run totals.
    pub fn log_summary(&self) {
        for r in &self.results {
            let name = sanitize_identifier(&r.key.to_string());
            match (&r.state, &r.error) {
                (TableState::Skipped, None) => {
                    tracing::debug!("- {}: skipped by filter", name);
                }
                (_, None) => tracing::info!(
                    "✓ {}: {} rows, checkpoint {}",
                    name,
                    r.rows_written,
                    display_checkpoint(r.effective_checkpoint())
                ),
                (_, Some(e)) if r.severity(self.skip_validation) == Severity::Warning => {
                    tracing::warn!("⚠ {}: {} ({} rows)", name, e, r.rows_written)
                }
                (state, Some(e)) => {
                    tracing::error!("✗ {} [{}]: {}", name, state, e)
                }
            }
        }

        if let Some(e) = &self.commit_error {
            tracing::error!("✗ Checkpoint commit failed: {}", e);
        }

        let fetch_time: Duration = self.results.iter().map(|r| r.fetch_time).sum();
        let write_time: Duration = self.results.iter().map(|r| r.write_time).sum();
        tracing::debug!(
            "Total fetch time {:.2?}, total write time {:.2?}",
            fetch_time,
            write_time
        );

        tracing::info!(
            "Sync finished in {:.1?}: {} committed, {} mismatched, {} failed, {} skipped, {} rows written",
            self.duration,
            self.count(TableState::Committed),
            self.count(TableState::Mismatched),
            self.count(TableState::Failed),
            self.count(TableState::Skipped),
            self.rows_written()
        );
    }
}

fn display_checkpoint(checkpoint: Option<&Checkpoint>) -> String {
    checkpoint
        .map(|c| c.to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// One planned table waiting for a worker.
struct TableJob<'a> {
    key: TableKey,
    target: &'a DatabaseTarget,
    spec: &'a TableSyncSpec,
    query: QuerySpec,
}

/// Drives every selected table spec of a config snapshot.
pub struct SyncOrchestrator {
    connections: ConnectionManager,
    options: SyncOptions,
    filter: SelectionFilter,
}

impl SyncOrchestrator {
    pub fn new(connections: ConnectionManager, options: SyncOptions, filter: SelectionFilter) -> Self {
        Self {
            connections,
            options,
            filter,
        }
    }

    /// Sync every selected table in `config` and commit checkpoint advances.
    ///
    /// `config` is treated as an immutable snapshot. Failures are recorded per
    /// table and never abort the run. Advances from tables that finished
    /// cleanly are committed to `store` in one call after all pipelines end,
    /// including when the run was cancelled part way.
    pub async fn run(
        &self,
        config: &SyncConfig,
        cancel: &CancellationToken,
        store: &dyn CheckpointStore,
    ) -> RunReport {
        let started = Instant::now();
        let mut tracker = CheckpointTracker::from_config(config);
        let mut results = Vec::new();
        let mut jobs = Vec::new();

        for (db_name, target) in &config.databases {
            let database_selected = self.filter.should_sync_database(db_name);
            if !database_selected {
                tracing::debug!("Skipping database {}: not selected", db_name);
            }

            for (index, spec) in target.tables.iter().enumerate() {
                let key = TableKey::new(db_name, index, &spec.name);
                let previous = tracker.starting_checkpoint(&key).cloned();

                if !database_selected || !self.filter.should_sync(&key, spec) {
                    let mut result = SyncResult::new(key, previous);
                    result.state = TableState::Skipped;
                    results.push(result);
                    continue;
                }

                match plan(spec) {
                    Ok(query) => jobs.push(TableJob {
                        key,
                        target,
                        spec,
                        query,
                    }),
                    Err(e) => {
                        tracing::error!("Skipping {}: {}", sanitize_identifier(&key.to_string()), e);
                        let mut result = SyncResult::new(key, previous);
                        result.state = TableState::Skipped;
                        result.error = Some(e);
                        results.push(result);
                    }
                }
            }
        }

        tracing::info!(
            "Syncing {} table(s) with concurrency {}",
            jobs.len(),
            self.options.concurrency.max(1)
        );

        let finished: Vec<SyncResult> = stream::iter(jobs)
            .map(|job| {
                let previous = tracker.starting_checkpoint(&job.key).cloned();
                self.sync_table(job, previous, cancel)
            })
            .buffer_unordered(self.options.concurrency.max(1))
            .collect()
            .await;

        let mut finished = finished;
        for result in finished.iter_mut() {
            let Some(checkpoint) = result.new_checkpoint.take() else {
                continue;
            };
            if tracker.record(result.key.clone(), checkpoint.clone()) {
                result.new_checkpoint = Some(checkpoint);
            } else {
                let e = SyncError::Checkpoint(format!(
                    "synced up to {} but that does not advance the stored checkpoint {}",
                    checkpoint,
                    display_checkpoint(result.previous_checkpoint.as_ref())
                ));
                tracing::error!("✗ {}: {}", sanitize_identifier(&result.key.to_string()), e);
                result.fail(e);
            }
        }
        results.extend(finished);
        results.sort_by(|a, b| a.key.cmp(&b.key));

        let (committed, commit_error) = match tracker.commit(store) {
            Ok(updates) => (updates, None),
            Err(e) => {
                for r in results.iter_mut() {
                    r.new_checkpoint = None;
                }
                (Vec::new(), Some(e))
            }
        };

        RunReport {
            results,
            committed,
            commit_error,
            skip_validation: self.options.skip_validation,
            duration: started.elapsed(),
        }
    }

    async fn sync_table(
        &self,
        job: TableJob<'_>,
        previous: Option<Checkpoint>,
        cancel: &CancellationToken,
    ) -> SyncResult {
        let started = Instant::now();
        let name = sanitize_identifier(&job.key.to_string());
        let mut result = SyncResult::new(job.key.clone(), previous);
        result.mode = Some(job.query.mode);

        if cancel.is_cancelled() {
            result.fail(SyncError::Cancelled);
            return result;
        }

        match job.query.mode {
            SyncMode::Full => tracing::info!("Syncing {} (full)", name),
            SyncMode::Incremental => tracing::info!(
                "Syncing {} (incremental since {})",
                name,
                display_checkpoint(result.previous_checkpoint.as_ref())
            ),
        }

        result.state = TableState::Connecting;
        let acquired = retry_with_backoff(
            || self.connections.acquire(job.target),
            self.options.max_retries,
            self.options.retry_delay,
            &format!("Connecting to {}", job.key.database),
        )
        .await;

        let mut conn = match acquired {
            Ok(conn) => conn,
            Err(e) => {
                result.fail(e);
                result.duration = started.elapsed();
                return result;
            }
        };

        let outcome = self.run_pipeline(&mut conn, &job, &mut result, cancel).await;
        conn.release().await;

        if let Err(e) = outcome {
            result.fail(e);
        }
        result.duration = started.elapsed();

        match &result.error {
            None => tracing::info!(
                "✓ {}: {} rows in {:.1?}",
                name,
                result.rows_written,
                result.duration
            ),
            Some(e) => tracing::error!("✗ {}: {}", name, e),
        }
        result
    }

    async fn run_pipeline(
        &self,
        conn: &mut ScopedConnection,
        job: &TableJob<'_>,
        result: &mut SyncResult,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        let timeout = self.options.query_timeout;
        let source = conn.source();
        let mut query = job.query.clone();

        if query.columns.is_empty() {
            let columns = with_timeout(timeout, source.describe(&query.table), |d| {
                SyncError::Fetch(format!("describe timed out after {:?}", d))
            })
            .await?;
            query.resolve_columns(columns);
        }

        let path = job
            .spec
            .output_path(&self.options.output_dir, &job.key.database);
        result.output = Some(path.clone());

        // Without a stored checkpoint, resume after the rows the output already holds
        let mut recovered = None;
        if query.mode == SyncMode::Incremental && query.since.is_none() {
            if let Some(column) = &query.incremental_column {
                recovered = last_checkpoint(&path, column).await?;
            }
            if let Some(checkpoint) = &recovered {
                tracing::warn!(
                    "⚠ {} has no stored checkpoint; resuming after {} found in {}",
                    sanitize_identifier(&job.key.to_string()),
                    checkpoint,
                    path.display()
                );
                query.since = recovered.clone();
            }
        }

        result.state = TableState::Syncing;

        let mut sink = CsvSink::open(&path, query.mode, &query.columns).await?;
        let progress = self.progress_bar(&job.key);

        let mut fetcher = BatchFetcher::new(&mut *source, &query, self.options.batch_size)
            .with_query_timeout(timeout);
        loop {
            if cancel.is_cancelled() {
                progress.abandon_with_message("cancelled");
                return Err(SyncError::Cancelled);
            }

            let fetch_started = Instant::now();
            let batch = match fetcher.next_batch().await {
                Ok(Some(batch)) => batch,
                Ok(None) => break,
                Err(e) => {
                    progress.abandon_with_message("failed");
                    return Err(e);
                }
            };
            result.fetch_time += fetch_started.elapsed();

            let write_started = Instant::now();
            let written = match sink.write_batch(&batch).await {
                Ok(written) => written,
                Err(e) => {
                    progress.abandon_with_message("failed");
                    return Err(e);
                }
            };
            result.write_time += write_started.elapsed();
            result.rows_written += written.rows;
            result.bytes_written += written.bytes;
            progress.inc(written.rows);
        }
        let high_water = fetcher.high_water().cloned();
        drop(fetcher);
        progress.finish_with_message("done");

        result.state = TableState::Validating;
        let validation = ValidationEngine::new(timeout)
            .validate(source, &query, result.rows_written)
            .await?;
        result.validation = Some(validation);

        let proposed = match (query.mode, high_water) {
            (SyncMode::Incremental, Some(value)) => Some(value.to_checkpoint()?),
            (SyncMode::Incremental, None) => recovered,
            _ => None,
        };

        match validation.mismatch() {
            None => {
                result.state = TableState::Committed;
                result.new_checkpoint = proposed;
            }
            Some(mismatch) => {
                result.state = TableState::Mismatched;
                if self.options.skip_validation {
                    result.new_checkpoint = proposed;
                }
                result.error = Some(mismatch);
            }
        }
        Ok(())
    }

    fn progress_bar(&self, key: &TableKey) -> ProgressBar {
        if !self.options.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner} [{elapsed_precise}] {prefix} {pos} rows ({per_sec}) {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_prefix(sanitize_identifier(&key.to_string()));
        pb.enable_steady_tick(Duration::from_millis(120));
        pb
    }
}
