// ABOUTME: Scoped acquisition of a source database connection, optionally via SSH tunnel
// ABOUTME: Defines the Source/Driver/Tunnel seams and guarantees teardown on every path

pub mod mysql;
pub mod tunnel;

use crate::config::{DatabaseTarget, SshTunnelSpec};
use crate::error::SyncError;
use crate::planner::QuerySpec;
use crate::utils::with_timeout;
use crate::value::SqlValue;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub use mysql::{MySqlDriver, MySqlSource};
pub use tunnel::{SshCommandOpener, SshTunnel};

/// An open connection to a source database.
///
/// Rows returned by [`Source::fetch_page`] are aligned with
/// [`QuerySpec::fetch_columns`].
#[async_trait]
pub trait Source: Send {
    /// Column names of a table, in ordinal order.
    async fn describe(&mut self, table: &str) -> Result<Vec<String>, SyncError>;

    /// Fetch one keyset page of at most `limit` rows after `cursor`.
    async fn fetch_page(
        &mut self,
        query: &QuerySpec,
        cursor: Option<&[SqlValue]>,
        limit: usize,
    ) -> Result<Vec<Vec<SqlValue>>, SyncError>;

    /// Count rows matching the query's predicate (ignoring any cursor).
    async fn count(&mut self, query: &QuerySpec) -> Result<u64, SyncError>;

    /// Base tables in the connected database.
    async fn list_tables(&mut self) -> Result<Vec<String>, SyncError>;

    /// Primary key columns of a table, in key order.
    async fn primary_key(&mut self, table: &str) -> Result<Vec<String>, SyncError>;

    /// Round-trip a trivial statement to prove the connection works.
    async fn ping(&mut self) -> Result<(), SyncError>;

    async fn close(self: Box<Self>) -> Result<(), SyncError>;
}

/// A running port forward to the database host.
#[async_trait]
pub trait Tunnel: Send {
    /// Local port that forwards to the remote database.
    fn local_port(&self) -> u16;

    async fn close(self: Box<Self>) -> Result<(), SyncError>;
}

/// Opens tunnels. Must only return once the local port accepts connections.
#[async_trait]
pub trait TunnelOpener: Send + Sync {
    async fn open(
        &self,
        spec: &SshTunnelSpec,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<Box<dyn Tunnel>, SyncError>;
}

/// Where the driver should connect: the database itself or a tunnel's local end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

/// Opens database connections.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        target: &DatabaseTarget,
    ) -> Result<Box<dyn Source>, SyncError>;
}

/// A database connection together with the tunnel it runs through.
///
/// Call [`ScopedConnection::release`] when done; it closes the connection and
/// then the tunnel.
pub struct ScopedConnection {
    source: Box<dyn Source>,
    tunnel: Option<Box<dyn Tunnel>>,
}

impl ScopedConnection {
    pub fn source(&mut self) -> &mut dyn Source {
        self.source.as_mut()
    }

    pub fn is_tunneled(&self) -> bool {
        self.tunnel.is_some()
    }

    /// Close the connection and tear down the tunnel, logging (not returning)
    /// close errors so callers can release on every exit path.
    pub async fn release(self) {
        if let Err(e) = self.source.close().await {
            tracing::warn!("Failed to close database connection cleanly: {}", e);
        }
        if let Some(tunnel) = self.tunnel {
            if let Err(e) = tunnel.close().await {
                tracing::warn!("Failed to close SSH tunnel cleanly: {}", e);
            }
        }
    }
}

/// Opens scoped connections for database targets.
///
/// Retries are not done here; the orchestrator decides whether to retry.
#[derive(Clone)]
pub struct ConnectionManager {
    tunnels: Arc<dyn TunnelOpener>,
    driver: Arc<dyn Driver>,
    connect_timeout: Option<Duration>,
}

impl ConnectionManager {
    pub fn new(tunnels: Arc<dyn TunnelOpener>, driver: Arc<dyn Driver>) -> Self {
        Self {
            tunnels,
            driver,
            connect_timeout: None,
        }
    }

    /// Production manager: `ssh` port forwards and `mysql_async` connections.
    pub fn mysql(connect_timeout: Duration) -> Self {
        Self::new(
            Arc::new(SshCommandOpener::new(connect_timeout)),
            Arc::new(MySqlDriver::new()),
        )
        .with_connect_timeout(connect_timeout)
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Acquire a connection for `target`.
    ///
    /// With an SSH spec the tunnel is opened first; if that fails the database
    /// connect is never attempted. If the database connect fails the tunnel is
    /// closed before the error is returned.
    pub async fn acquire(&self, target: &DatabaseTarget) -> Result<ScopedConnection, SyncError> {
        let tunnel = match target.ssh_tunnel()? {
            Some(spec) => {
                tracing::debug!(
                    "Opening SSH tunnel via {}@{}:{} to {}:{}",
                    spec.username,
                    spec.host,
                    spec.port,
                    target.db_host,
                    target.db_port
                );
                let tunnel = self
                    .tunnels
                    .open(&spec, &target.db_host, target.db_port)
                    .await
                    .map_err(|e| match e {
                        SyncError::Connection { .. } => e,
                        other => SyncError::tunnel(other.to_string()),
                    })?;
                Some(tunnel)
            }
            None => None,
        };

        let endpoint = match &tunnel {
            Some(t) => Endpoint {
                host: "127.0.0.1".to_string(),
                port: t.local_port(),
            },
            None => Endpoint {
                host: target.db_host.clone(),
                port: target.db_port,
            },
        };

        let connected = with_timeout(
            self.connect_timeout,
            self.driver.connect(&endpoint, target),
            |d| SyncError::database(format!("connect timed out after {:?}", d)),
        )
        .await;

        match connected {
            Ok(source) => Ok(ScopedConnection { source, tunnel }),
            Err(e) => {
                if let Some(tunnel) = tunnel {
                    if let Err(close_err) = tunnel.close().await {
                        tracing::warn!("Failed to close SSH tunnel after connect error: {}", close_err);
                    }
                }
                Err(match e {
                    SyncError::Connection { .. } => e,
                    other => SyncError::database(other.to_string()),
                })
            }
        }
    }
}
