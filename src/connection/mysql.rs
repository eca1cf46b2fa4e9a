// ABOUTME: mysql_async implementation of the Source and Driver seams
// ABOUTME: Executes rendered plans with bound parameters and normalizes MySQL values

use super::{Driver, Endpoint, Source};
use crate::config::DatabaseTarget;
use crate::error::SyncError;
use crate::planner::{QuerySpec, RenderedQuery};
use crate::value::SqlValue;
use async_trait::async_trait;
use mysql_async::consts::ColumnType;
use mysql_async::prelude::*;
use mysql_async::{Conn, OptsBuilder, Params, Row, Value};

/// Connects to MySQL with `mysql_async`.
#[derive(Debug, Default)]
pub struct MySqlDriver;

impl MySqlDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Driver for MySqlDriver {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        target: &DatabaseTarget,
    ) -> Result<Box<dyn Source>, SyncError> {
        let opts = OptsBuilder::default()
            .ip_or_hostname(endpoint.host.clone())
            .tcp_port(endpoint.port)
            .user(Some(target.db_username.clone()))
            .pass(Some(target.db_password.clone()))
            .db_name(Some(target.db_name.clone()));

        let conn = Conn::new(opts).await.map_err(|e| {
            SyncError::database(format!(
                "failed to connect to {}:{}/{}: {}",
                endpoint.host, endpoint.port, target.db_name, e
            ))
        })?;

        tracing::debug!(
            "Connected to MySQL {}:{}/{}",
            endpoint.host,
            endpoint.port,
            target.db_name
        );
        Ok(Box::new(MySqlSource { conn }))
    }
}

/// An open MySQL connection.
pub struct MySqlSource {
    conn: Conn,
}

impl MySqlSource {
    async fn exec_rows(&mut self, query: RenderedQuery) -> Result<Vec<Row>, mysql_async::Error> {
        tracing::debug!("Executing query: {}", query.sql);
        let params = to_params(query.params);
        self.conn.exec(query.sql, params).await
    }
}

#[async_trait]
impl Source for MySqlSource {
    async fn describe(&mut self, table: &str) -> Result<Vec<String>, SyncError> {
        let columns: Vec<String> = self
            .conn
            .exec(
                "SELECT COLUMN_NAME FROM information_schema.COLUMNS \
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? \
                 ORDER BY ORDINAL_POSITION",
                (table,),
            )
            .await
            .map_err(|e| SyncError::Fetch(format!("failed to describe {}: {}", table, e)))?;

        if columns.is_empty() {
            return Err(SyncError::Fetch(format!("table '{}' not found", table)));
        }
        Ok(columns)
    }

    async fn fetch_page(
        &mut self,
        query: &QuerySpec,
        cursor: Option<&[SqlValue]>,
        limit: usize,
    ) -> Result<Vec<Vec<SqlValue>>, SyncError> {
        let rows = self
            .exec_rows(query.select_sql(cursor, limit))
            .await
            .map_err(|e| SyncError::Fetch(format!("failed to read from {}: {}", query.table, e)))?;

        Ok(rows.iter().map(convert_row).collect())
    }

    async fn count(&mut self, query: &QuerySpec) -> Result<u64, SyncError> {
        let rendered = query.count_sql();
        tracing::debug!("Executing count query: {}", rendered.sql);
        let count: Option<i64> = self
            .conn
            .exec_first(rendered.sql, to_params(rendered.params))
            .await
            .map_err(|e| SyncError::Fetch(format!("failed to count {}: {}", query.table, e)))?;
        Ok(count.unwrap_or(0).max(0) as u64)
    }

    async fn list_tables(&mut self) -> Result<Vec<String>, SyncError> {
        self.conn
            .query(
                "SELECT TABLE_NAME FROM information_schema.TABLES \
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_TYPE = 'BASE TABLE' \
                 ORDER BY TABLE_NAME",
            )
            .await
            .map_err(|e| SyncError::Fetch(format!("failed to list tables: {}", e)))
    }

    async fn primary_key(&mut self, table: &str) -> Result<Vec<String>, SyncError> {
        self.conn
            .exec(
                "SELECT COLUMN_NAME FROM information_schema.KEY_COLUMN_USAGE \
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? \
                 AND CONSTRAINT_NAME = 'PRIMARY' \
                 ORDER BY ORDINAL_POSITION",
                (table,),
            )
            .await
            .map_err(|e| SyncError::Fetch(format!("failed to read primary key of {}: {}", table, e)))
    }

    async fn ping(&mut self) -> Result<(), SyncError> {
        let one: Option<i64> = self
            .conn
            .query_first("SELECT 1")
            .await
            .map_err(|e| SyncError::database(e.to_string()))?;
        match one {
            Some(1) => Ok(()),
            other => Err(SyncError::database(format!(
                "unexpected ping result: {:?}",
                other
            ))),
        }
    }

    async fn close(self: Box<Self>) -> Result<(), SyncError> {
        self.conn
            .disconnect()
            .await
            .map_err(|e| SyncError::database(format!("disconnect failed: {}", e)))
    }
}

fn to_params(values: Vec<SqlValue>) -> Params {
    if values.is_empty() {
        return Params::Empty;
    }
    Params::Positional(values.into_iter().map(to_mysql_value).collect())
}

fn to_mysql_value(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::NULL,
        SqlValue::Int(v) => Value::Int(v),
        SqlValue::UInt(v) => Value::UInt(v),
        SqlValue::Float(v) => Value::Double(v),
        SqlValue::Text(s) => Value::Bytes(s.into_bytes()),
        SqlValue::Bytes(b) => Value::Bytes(b),
    }
}

fn convert_row(row: &Row) -> Vec<SqlValue> {
    let columns = row.columns_ref();
    (0..row.len())
        .map(|idx| {
            let is_date = columns
                .get(idx)
                .map(|c| matches!(c.column_type(), ColumnType::MYSQL_TYPE_DATE))
                .unwrap_or(false);
            match row.as_ref(idx) {
                Some(value) => convert_value(value, is_date),
                None => SqlValue::Null,
            }
        })
        .collect()
}

/// Normalize a MySQL value. Temporal values become text in a form whose
/// lexical order matches chronological order.
fn convert_value(value: &Value, date_only: bool) -> SqlValue {
    match value {
        Value::NULL => SqlValue::Null,
        Value::Int(v) => SqlValue::Int(*v),
        Value::UInt(v) => SqlValue::UInt(*v),
        Value::Float(v) => SqlValue::Float(*v as f64),
        Value::Double(v) => SqlValue::Float(*v),
        Value::Bytes(b) => match std::str::from_utf8(b) {
            Ok(s) => SqlValue::Text(s.to_string()),
            Err(_) => SqlValue::Bytes(b.clone()),
        },
        Value::Date(year, month, day, hour, minute, second, micros) => {
            if date_only {
                SqlValue::Text(format!("{:04}-{:02}-{:02}", year, month, day))
            } else if *micros > 0 {
                SqlValue::Text(format!(
                    "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}",
                    year, month, day, hour, minute, second, micros
                ))
            } else {
                SqlValue::Text(format!(
                    "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                    year, month, day, hour, minute, second
                ))
            }
        }
        Value::Time(negative, days, hours, minutes, seconds, micros) => {
            let sign = if *negative { "-" } else { "" };
            let total_hours = *days * 24 + u32::from(*hours);
            if *micros > 0 {
                SqlValue::Text(format!(
                    "{}{:02}:{:02}:{:02}.{:06}",
                    sign, total_hours, minutes, seconds, micros
                ))
            } else {
                SqlValue::Text(format!(
                    "{}{:02}:{:02}:{:02}",
                    sign, total_hours, minutes, seconds
                ))
            }
        }
    }
}
