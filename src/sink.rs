// ABOUTME: CsvSink - writes fetched batches to a table's CSV output file
// ABOUTME: Truncates for full syncs, appends for incremental ones, fsyncs every batch

use crate::error::SyncError;
use crate::fetcher::RowBatch;
use crate::planner::SyncMode;
use crate::value::Checkpoint;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Rows and bytes written by one call, or accumulated over a sink's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub rows: u64,
    pub bytes: u64,
}

impl std::ops::AddAssign for WriteStats {
    fn add_assign(&mut self, other: Self) {
        self.rows += other.rows;
        self.bytes += other.bytes;
    }
}

/// An open CSV output file.
///
/// Only the first `header.len()` fields of each row are written, so ordering
/// columns fetched for the cursor but not projected stay out of the file.
pub struct CsvSink {
    path: PathBuf,
    file: File,
    width: usize,
    total: WriteStats,
}

impl CsvSink {
    /// Open `path` for `mode`.
    ///
    /// Full mode truncates (or creates) the file and writes the header.
    /// Incremental mode appends, writing the header only if the file is new
    /// or empty. Missing parent directories are created.
    pub async fn open(path: &Path, mode: SyncMode, header: &[String]) -> Result<Self, SyncError> {
        if header.is_empty() {
            return Err(SyncError::Write(format!(
                "no columns to write to {}",
                path.display()
            )));
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                SyncError::Write(format!("failed to create {}: {}", parent.display(), e))
            })?;
        }

        let mut options = OpenOptions::new();
        match mode {
            SyncMode::Full => options.write(true).create(true).truncate(true),
            SyncMode::Incremental => options.append(true).create(true),
        };
        let file = options
            .open(path)
            .await
            .map_err(|e| SyncError::Write(format!("failed to open {}: {}", path.display(), e)))?;

        let existing = file
            .metadata()
            .await
            .map_err(|e| SyncError::Write(format!("failed to stat {}: {}", path.display(), e)))?
            .len();

        let mut sink = Self {
            path: path.to_path_buf(),
            file,
            width: header.len(),
            total: WriteStats::default(),
        };

        if existing == 0 {
            let bytes = encode(std::iter::once(
                header.iter().map(|h| h.as_bytes()).collect::<Vec<_>>(),
            ))?;
            sink.persist(&bytes).await?;
            tracing::debug!("Wrote header to {}", path.display());
        }

        Ok(sink)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Data rows and bytes written so far, excluding the header.
    pub fn total(&self) -> WriteStats {
        self.total
    }

    /// Append a batch and flush it to durable storage.
    pub async fn write_batch(&mut self, batch: &RowBatch) -> Result<WriteStats, SyncError> {
        if batch.is_empty() {
            return Ok(WriteStats::default());
        }

        let width = self.width;
        let mut records = Vec::with_capacity(batch.len());
        for row in &batch.rows {
            if row.len() < width {
                return Err(SyncError::Write(format!(
                    "row has {} fields but {} has {} columns",
                    row.len(),
                    self.path.display(),
                    width
                )));
            }
            records.push(row[..width].iter().map(|v| v.as_csv_field()).collect::<Vec<_>>());
        }

        let bytes = encode(records)?;
        self.persist(&bytes).await?;

        let stats = WriteStats {
            rows: batch.len() as u64,
            bytes: bytes.len() as u64,
        };
        self.total += stats;
        Ok(stats)
    }

    async fn persist(&mut self, bytes: &[u8]) -> Result<(), SyncError> {
        self.file
            .write_all(bytes)
            .await
            .map_err(|e| SyncError::Write(format!("failed to write {}: {}", self.path.display(), e)))?;
        self.file
            .flush()
            .await
            .map_err(|e| SyncError::Write(format!("failed to flush {}: {}", self.path.display(), e)))?;
        self.file
            .sync_data()
            .await
            .map_err(|e| SyncError::Write(format!("failed to sync {}: {}", self.path.display(), e)))
    }
}

/// Recover an incremental checkpoint from an existing output file.
///
/// Scans `column` in the file and returns its highest value: numeric if every
/// non-empty value parses as an integer, otherwise the greatest string.
/// Returns `None` when the file is missing or holds no data rows. A file with
/// rows but without `column` in its header cannot be resumed and is an error.
pub async fn last_checkpoint(path: &Path, column: &str) -> Result<Option<Checkpoint>, SyncError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.len() > 0 => {}
        Ok(_) => return Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(SyncError::Write(format!(
                "failed to stat {}: {}",
                path.display(),
                e
            )))
        }
    }

    let path = path.to_path_buf();
    let column = column.to_string();
    tokio::task::spawn_blocking(move || scan_max(&path, &column))
        .await
        .map_err(|e| SyncError::Write(format!("checkpoint scan panicked: {}", e)))?
}

fn scan_max(path: &Path, column: &str) -> Result<Option<Checkpoint>, SyncError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|e| SyncError::Write(format!("failed to read {}: {}", path.display(), e)))?;
    let index = reader
        .headers()
        .map_err(|e| SyncError::Write(format!("failed to read {}: {}", path.display(), e)))?
        .iter()
        .position(|h| h == column);

    let mut max_int: Option<i64> = None;
    let mut max_text: Option<String> = None;
    let mut all_int = true;
    let mut rows = 0u64;

    for record in reader.records() {
        let record = record
            .map_err(|e| SyncError::Write(format!("failed to read {}: {}", path.display(), e)))?;
        rows += 1;
        let Some(index) = index else {
            break;
        };
        let Some(field) = record.get(index).filter(|f| !f.is_empty()) else {
            continue;
        };
        match field.parse::<i64>() {
            Ok(v) => max_int = Some(max_int.map_or(v, |m| m.max(v))),
            Err(_) => all_int = false,
        }
        if max_text.as_deref().map_or(true, |m| field > m) {
            max_text = Some(field.to_string());
        }
    }

    if index.is_none() {
        if rows == 0 {
            return Ok(None);
        }
        return Err(SyncError::Config(format!(
            "{} already holds rows but has no '{}' column to resume from; set last_id or remove the file",
            path.display(),
            column
        )));
    }

    if all_int {
        Ok(max_int.map(Checkpoint::Int))
    } else {
        Ok(max_text.map(Checkpoint::Text))
    }
}

/// Serialize records with standard CSV quoting.
fn encode<I, R, F>(records: I) -> Result<Vec<u8>, SyncError>
where
    I: IntoIterator<Item = R>,
    R: IntoIterator<Item = F>,
    F: AsRef<[u8]>,
{
    let mut writer = csv::WriterBuilder::new()
        .quote_style(csv::QuoteStyle::Necessary)
        .from_writer(Vec::new());
    for record in records {
        writer.write_record(record)?;
    }
    writer
        .into_inner()
        .map_err(|e| SyncError::Write(format!("failed to encode CSV: {}", e)))
}
