// ABOUTME: ValidationEngine - confirms a table pass wrote every matching source row
// ABOUTME: Re-runs the plan's predicate as a COUNT and compares it to rows written

use crate::connection::Source;
use crate::error::SyncError;
use crate::planner::QuerySpec;
use crate::utils::with_timeout;
use std::time::Duration;

/// Outcome of comparing the rows written in a pass with the source count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validation {
    pub written: u64,
    pub source_count: u64,
}

impl Validation {
    pub fn is_match(&self) -> bool {
        self.written == self.source_count
    }

    /// The mismatch as an error, if there is one.
    pub fn mismatch(&self) -> Option<SyncError> {
        if self.is_match() {
            None
        } else {
            Some(SyncError::ValidationMismatch {
                expected: self.written,
                actual: self.source_count,
            })
        }
    }
}

/// Counts source rows with the same predicate the fetch used.
///
/// For incremental plans the predicate is `incremental_column > old_checkpoint`
/// (plus any `where`), so the count covers exactly the delta being synced.
#[derive(Debug, Clone, Default)]
pub struct ValidationEngine {
    query_timeout: Option<Duration>,
}

impl ValidationEngine {
    pub fn new(query_timeout: Option<Duration>) -> Self {
        Self { query_timeout }
    }

    pub async fn validate(
        &self,
        source: &mut dyn Source,
        query: &QuerySpec,
        written: u64,
    ) -> Result<Validation, SyncError> {
        let table = query.table.clone();
        let source_count = with_timeout(self.query_timeout, source.count(query), |d| {
            SyncError::Fetch(format!("count on {} timed out after {:?}", table, d))
        })
        .await?;

        let validation = Validation {
            written,
            source_count,
        };

        if validation.is_match() {
            tracing::debug!(
                "Validation passed for {}: {} rows",
                query.table,
                written
            );
        } else {
            tracing::warn!(
                "Validation mismatch for {}: wrote {} rows, source has {}",
                query.table,
                written,
                source_count
            );
        }
        Ok(validation)
    }
}
