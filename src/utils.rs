// ABOUTME: Utility functions shared by the sync engine
// ABOUTME: Provides retry with backoff, identifier quoting and display sanitizing

use crate::error::SyncError;
use std::time::Duration;

/// Retry an operation with exponential backoff
///
/// Only errors for which [`SyncError::is_retryable`] returns true are retried;
/// anything else is returned immediately. Each retry doubles the delay.
///
/// # Arguments
///
/// * `operation` - Async closure producing the result
/// * `max_retries` - Maximum number of retry attempts (0 = just the initial attempt)
/// * `initial_delay` - Delay before the first retry
/// * `operation_name` - Name used in log messages
///
/// # Examples
///
/// ```
/// # use mysql_csv_sync::utils::retry_with_backoff;
/// # use mysql_csv_sync::error::SyncError;
/// # use std::time::Duration;
/// # async fn example() -> Result<(), SyncError> {
/// let value = retry_with_backoff(
///     || async { Ok::<_, SyncError>(42) },
///     3,
///     Duration::from_millis(10),
///     "example",
/// )
/// .await?;
/// assert_eq!(value, 42);
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T>(
    mut operation: F,
    max_retries: u32,
    initial_delay: Duration,
    operation_name: &str,
) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, SyncError>>,
{
    let mut delay = initial_delay;
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && attempt < max_retries => {
                attempt += 1;
                tracing::warn!(
                    "{} failed (attempt {}/{}): {}. Retrying in {:?}...",
                    operation_name,
                    attempt,
                    max_retries + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Sanitize an identifier (table name, column name, etc.) for display
///
/// Removes control characters and limits length so identifiers coming from a
/// config file cannot inject lines into the logs.
///
/// # Examples
///
/// ```
/// # use mysql_csv_sync::utils::sanitize_identifier;
/// assert_eq!(sanitize_identifier("normal_table"), "normal_table");
/// assert_eq!(sanitize_identifier("table\nname"), "tablename");
/// ```
pub fn sanitize_identifier(identifier: &str) -> String {
    identifier
        .chars()
        .filter(|c| !c.is_control())
        .take(100)
        .collect()
}

/// Quote a MySQL identifier (database, table, column)
///
/// MySQL uses backticks for identifier quoting. Escapes embedded backticks
/// by doubling them.
///
/// # Examples
///
/// ```
/// use mysql_csv_sync::utils::quote_mysql_ident;
/// assert_eq!(quote_mysql_ident("users"), "`users`");
/// assert_eq!(quote_mysql_ident("user`name"), "`user``name`");
/// ```
pub fn quote_mysql_ident(identifier: &str) -> String {
    let mut quoted = String::with_capacity(identifier.len() + 2);
    quoted.push('`');
    for ch in identifier.chars() {
        if ch == '`' {
            quoted.push('`');
        }
        quoted.push(ch);
    }
    quoted.push('`');
    quoted
}

/// Run an I/O future under an optional timeout.
///
/// On expiry the error produced by `on_timeout` is returned.
pub async fn with_timeout<T, Fut>(
    timeout: Option<Duration>,
    fut: Fut,
    on_timeout: impl FnOnce(Duration) -> SyncError,
) -> Result<T, SyncError>
where
    Fut: std::future::Future<Output = Result<T, SyncError>>,
{
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(on_timeout(limit)),
        },
        None => fut.await,
    }
}
