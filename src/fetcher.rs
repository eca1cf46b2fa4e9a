// ABOUTME: BatchFetcher - streams a planned query in bounded keyset pages
// ABOUTME: Tracks the cursor and the highest incremental value seen so far

use crate::connection::Source;
use crate::error::SyncError;
use crate::planner::QuerySpec;
use crate::utils::with_timeout;
use crate::value::SqlValue;
use std::cmp::Ordering;
use std::time::Duration;

/// One page of rows, each aligned with [`QuerySpec::fetch_columns`].
#[derive(Debug, Clone, PartialEq)]
pub struct RowBatch {
    pub rows: Vec<Vec<SqlValue>>,
}

impl RowBatch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Single-pass reader over a [`QuerySpec`].
///
/// Pages with keyset pagination on the ordering columns, never OFFSET, so rows
/// inserted ahead of the cursor while the scan runs are still picked up. A page
/// shorter than `batch_size` ends the sequence. Any error exhausts the fetcher.
pub struct BatchFetcher<'a> {
    source: &'a mut dyn Source,
    query: &'a QuerySpec,
    batch_size: usize,
    query_timeout: Option<Duration>,
    cursor_indices: Vec<usize>,
    incremental_index: Option<usize>,
    cursor: Option<Vec<SqlValue>>,
    high_water: Option<SqlValue>,
    pages: usize,
    exhausted: bool,
}

impl<'a> BatchFetcher<'a> {
    pub fn new(source: &'a mut dyn Source, query: &'a QuerySpec, batch_size: usize) -> Self {
        Self {
            source,
            query,
            batch_size: batch_size.max(1),
            query_timeout: None,
            cursor_indices: query.cursor_indices(),
            incremental_index: query.incremental_index(),
            cursor: None,
            high_water: None,
            pages: 0,
            exhausted: false,
        }
    }

    pub fn with_query_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Highest incremental-column value returned so far.
    pub fn high_water(&self) -> Option<&SqlValue> {
        self.high_water.as_ref()
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Fetch the next page, or `None` once the scan is complete.
    pub async fn next_batch(&mut self) -> Result<Option<RowBatch>, SyncError> {
        if self.exhausted {
            return Ok(None);
        }

        match self.fetch_page().await {
            Ok(batch) => Ok(batch),
            Err(e) => {
                self.exhausted = true;
                Err(e)
            }
        }
    }

    async fn fetch_page(&mut self) -> Result<Option<RowBatch>, SyncError> {
        let table = self.query.table.clone();
        let rows = with_timeout(
            self.query_timeout,
            self.source
                .fetch_page(self.query, self.cursor.as_deref(), self.batch_size),
            |d| SyncError::Fetch(format!("query on {} timed out after {:?}", table, d)),
        )
        .await?;

        self.pages += 1;

        if rows.len() > self.batch_size {
            return Err(SyncError::Fetch(format!(
                "page of {} rows from {} exceeds batch size {}",
                rows.len(),
                table,
                self.batch_size
            )));
        }
        if rows.len() < self.batch_size {
            self.exhausted = true;
        }
        if rows.is_empty() {
            return Ok(None);
        }

        for row in &rows {
            let key = self.cursor_of(row)?;
            if let Some(prev) = &self.cursor {
                if !is_after(prev, &key) {
                    return Err(SyncError::Fetch(format!(
                        "rows from {} are not in ascending {} order",
                        table,
                        self.query.order_by.join(", ")
                    )));
                }
            }
            self.cursor = Some(key);
        }

        if let Some(idx) = self.incremental_index {
            if let Some(last) = rows.last().and_then(|row| row.get(idx)) {
                self.high_water = Some(last.clone());
            }
        }

        tracing::debug!(
            "Fetched page {} of {} ({} rows)",
            self.pages,
            table,
            rows.len()
        );
        Ok(Some(RowBatch { rows }))
    }

    fn cursor_of(&self, row: &[SqlValue]) -> Result<Vec<SqlValue>, SyncError> {
        self.cursor_indices
            .iter()
            .map(|&idx| {
                row.get(idx).cloned().ok_or_else(|| {
                    SyncError::Fetch(format!(
                        "row from {} has {} columns, expected at least {}",
                        self.query.table,
                        row.len(),
                        idx + 1
                    ))
                })
            })
            .collect()
    }
}

/// Whether `next` sorts strictly after `prev` in keyset order.
///
/// Text comparisons are left to the server's collation and never flagged.
fn is_after(prev: &[SqlValue], next: &[SqlValue]) -> bool {
    for (a, b) in prev.iter().zip(next) {
        if is_textual(a) || is_textual(b) {
            return true;
        }
        match a.compare(b) {
            Some(Ordering::Less) => return true,
            Some(Ordering::Greater) => return false,
            Some(Ordering::Equal) => continue,
            None => return true,
        }
    }
    false
}

fn is_textual(value: &SqlValue) -> bool {
    matches!(value, SqlValue::Text(_) | SqlValue::Bytes(_))
}
