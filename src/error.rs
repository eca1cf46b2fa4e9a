// ABOUTME: Error taxonomy for the table sync engine
// ABOUTME: Classifies failures by stage and maps them to per-table severity

use std::fmt;
use thiserror::Error;

/// Which step of connection acquisition failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStage {
    Tunnel,
    Database,
}

impl fmt::Display for ConnectionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStage::Tunnel => write!(f, "tunnel"),
            ConnectionStage::Database => write!(f, "database"),
        }
    }
}

/// Errors produced while syncing a single table.
///
/// Every variant is scoped to one table: the orchestrator records it on that
/// table's result and moves on to the next one.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("connection error ({stage}): {message}")]
    Connection {
        stage: ConnectionStage,
        message: String,
    },

    #[error("fetch error: {0}")]
    Fetch(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("validation mismatch: wrote {expected} rows but source count is {actual}")]
    ValidationMismatch { expected: u64, actual: u64 },

    #[error("config error: {0}")]
    Config(String),

    #[error("sync cancelled")]
    Cancelled,

    #[error("checkpoint persistence error: {0}")]
    Checkpoint(String),
}

impl SyncError {
    pub fn tunnel(message: impl Into<String>) -> Self {
        SyncError::Connection {
            stage: ConnectionStage::Tunnel,
            message: message.into(),
        }
    }

    pub fn database(message: impl Into<String>) -> Self {
        SyncError::Connection {
            stage: ConnectionStage::Database,
            message: message.into(),
        }
    }

    /// Severity of this error when it ends a table sync.
    ///
    /// Mismatches are downgraded to warnings when validation was explicitly skipped.
    pub fn severity(&self, skip_validation: bool) -> Severity {
        match self {
            SyncError::ValidationMismatch { .. } if skip_validation => Severity::Warning,
            _ => Severity::Error,
        }
    }

    /// Connection errors are the only ones worth retrying at acquisition time.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Connection { .. })
    }
}

impl From<csv::Error> for SyncError {
    fn from(err: csv::Error) -> Self {
        SyncError::Write(err.to_string())
    }
}

/// Aggregated outcome severity, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Ok,
    Warning,
    Error,
}
