// ABOUTME: Turns a table spec and its checkpoint into a query plan
// ABOUTME: Renders keyset-paginated SELECT and matching COUNT statements for MySQL

use crate::config::TableSyncSpec;
use crate::error::SyncError;
use crate::utils::quote_mysql_ident;
use crate::value::{Checkpoint, SqlValue};

/// Whether a table is rewritten from scratch or extended past its checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Full,
    Incremental,
}

/// Everything needed to read one table: predicate, ordering and projection.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpec {
    pub table: String,
    /// Projected columns in output order (empty = all, resolved before fetching)
    pub columns: Vec<String>,
    pub filter: Option<String>,
    pub mode: SyncMode,
    pub incremental_column: Option<String>,
    /// Lower bound (exclusive) on the incremental column
    pub since: Option<Checkpoint>,
    /// Ordering columns, most significant first; also the keyset cursor
    pub order_by: Vec<String>,
}

/// SQL text with positional `?` parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedQuery {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

/// Plan the query for one table spec.
///
/// Full mode selects every row matching `where`, ordered by primary key.
/// Incremental mode additionally requires `incremental_column > last_id` and
/// orders by the incremental column, with the primary key as tie-breaker so
/// pages never split a run of equal values.
///
/// # Errors
///
/// Returns [`SyncError::Config`] for specs that cannot be planned, before any
/// I/O happens.
pub fn plan(spec: &TableSyncSpec) -> Result<QuerySpec, SyncError> {
    let table = spec.name.trim();
    if table.is_empty() {
        return Err(SyncError::Config("table name is empty".to_string()));
    }

    let primary_key = spec.primary_key.trim();
    if primary_key.is_empty() {
        return Err(SyncError::Config(format!(
            "table '{}' has no primary_key configured",
            table
        )));
    }

    if spec.columns.iter().any(|c| c.trim().is_empty()) {
        return Err(SyncError::Config(format!(
            "table '{}' has an empty column name in its column list",
            table
        )));
    }

    let filter = spec.filter_clause().map(str::to_string);

    if !spec.incremental {
        return Ok(QuerySpec {
            table: table.to_string(),
            columns: spec.columns.clone(),
            filter,
            mode: SyncMode::Full,
            incremental_column: None,
            since: None,
            order_by: vec![primary_key.to_string()],
        });
    }

    let incremental_column = spec.incremental_column().ok_or_else(|| {
        SyncError::Config(format!(
            "table '{}' is incremental but has no incremental_column",
            table
        ))
    })?;

    let mut order_by = vec![incremental_column.to_string()];
    if incremental_column != primary_key {
        order_by.push(primary_key.to_string());
    }

    Ok(QuerySpec {
        table: table.to_string(),
        columns: spec.columns.clone(),
        filter,
        mode: SyncMode::Incremental,
        incremental_column: Some(incremental_column.to_string()),
        since: spec.last_id.clone(),
        order_by,
    })
}

impl QuerySpec {
    /// Replace an empty projection with the table's full column list.
    pub fn resolve_columns(&mut self, table_columns: Vec<String>) {
        if self.columns.is_empty() {
            self.columns = table_columns;
        }
    }

    /// Columns actually selected: the projection plus any ordering column it
    /// lacks, which is needed for the keyset cursor but not written out.
    pub fn fetch_columns(&self) -> Vec<String> {
        let mut cols = self.columns.clone();
        for col in &self.order_by {
            if !cols.contains(col) {
                cols.push(col.clone());
            }
        }
        cols
    }

    /// Positions of the ordering columns within [`Self::fetch_columns`].
    pub fn cursor_indices(&self) -> Vec<usize> {
        let fetch = self.fetch_columns();
        self.order_by
            .iter()
            .filter_map(|col| fetch.iter().position(|c| c == col))
            .collect()
    }

    /// Position of the incremental column within [`Self::fetch_columns`].
    pub fn incremental_index(&self) -> Option<usize> {
        let col = self.incremental_column.as_ref()?;
        self.fetch_columns().iter().position(|c| c == col)
    }

    /// Predicates shared by the page query and the validation count.
    fn predicates(&self) -> (Vec<String>, Vec<SqlValue>) {
        let mut clauses = Vec::new();
        let mut params = Vec::new();

        if let Some(filter) = &self.filter {
            clauses.push(format!("({})", filter));
        }

        if let Some(col) = &self.incremental_column {
            match &self.since {
                Some(since) => {
                    clauses.push(format!("{} > ?", quote_mysql_ident(col)));
                    params.push(SqlValue::from(since));
                }
                // NULLs sort first and would stall the cursor
                None => clauses.push(format!("{} IS NOT NULL", quote_mysql_ident(col))),
            }
        }

        (clauses, params)
    }

    /// Render one page of the keyset scan.
    ///
    /// `cursor` holds the ordering-column values of the last row already
    /// fetched (in `order_by` order), or `None` for the first page.
    pub fn select_sql(&self, cursor: Option<&[SqlValue]>, limit: usize) -> RenderedQuery {
        let (mut clauses, mut params) = self.predicates();

        if let Some(cursor) = cursor {
            let (clause, cursor_params) = self.keyset_clause(cursor);
            clauses.push(clause);
            params.extend(cursor_params);
        }

        let projection = self
            .fetch_columns()
            .iter()
            .map(|c| quote_mysql_ident(c))
            .collect::<Vec<_>>()
            .join(", ");

        let order = self
            .order_by
            .iter()
            .map(|c| format!("{} ASC", quote_mysql_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");

        let mut sql = format!(
            "SELECT {} FROM {}",
            projection,
            quote_mysql_ident(&self.table)
        );
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(&format!(" ORDER BY {} LIMIT {}", order, limit));

        RenderedQuery { sql, params }
    }

    /// Render the count query used for validation: same predicate, no cursor.
    pub fn count_sql(&self) -> RenderedQuery {
        let (clauses, params) = self.predicates();
        let mut sql = format!("SELECT COUNT(*) FROM {}", quote_mysql_ident(&self.table));
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        RenderedQuery { sql, params }
    }

    fn keyset_clause(&self, cursor: &[SqlValue]) -> (String, Vec<SqlValue>) {
        match (self.order_by.as_slice(), cursor) {
            ([a, b], [va, vb]) => (
                format!(
                    "({a} > ? OR ({a} = ? AND {b} > ?))",
                    a = quote_mysql_ident(a),
                    b = quote_mysql_ident(b)
                ),
                vec![va.clone(), va.clone(), vb.clone()],
            ),
            _ => (
                format!("{} > ?", quote_mysql_ident(&self.order_by[0])),
                vec![cursor[0].clone()],
            ),
        }
    }
}
