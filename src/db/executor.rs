//! Query execution with an execute-then-release discipline.
//!
//! Each call borrows a connection, runs exactly one query or statement batch
//! and hands the connection back before returning, on success and on error.
//! A connection whose call did not finish (timeout, dropped future) is
//! discarded instead of going back to the idle set.

use crate::db::connection::{Connect, Connection};
use crate::db::pool::{ConnectionPool, PooledConnection};
use crate::error::{DbError, DbResult};
use crate::models::{Row, Value};
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Runs single queries and statements through a [`ConnectionPool`].
pub struct QueryExecutor<C: Connect> {
    pool: ConnectionPool<C>,
    query_timeout: Option<Duration>,
}

impl<C: Connect> Clone for QueryExecutor<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            query_timeout: self.query_timeout,
        }
    }
}

impl<C: Connect> fmt::Debug for QueryExecutor<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryExecutor")
            .field("pool", &self.pool)
            .field("query_timeout", &self.query_timeout)
            .finish()
    }
}

impl<C: Connect> QueryExecutor<C> {
    /// Create an executor without a query timeout.
    pub fn new(pool: ConnectionPool<C>) -> Self {
        Self {
            pool,
            query_timeout: None,
        }
    }

    /// Bound every query to `limit`.
    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.query_timeout = Some(limit);
        self
    }

    pub fn pool(&self) -> &ConnectionPool<C> {
        &self.pool
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        self.query_timeout
    }

    /// Run a parameterized query and return its rows.
    pub async fn execute(&self, sql: &str, params: &[Value]) -> DbResult<Vec<Row>> {
        let start = Instant::now();
        let mut conn = self.pool.borrow().await?;

        debug!(
            connection_id = %conn.id(),
            sql = %sql,
            params = params.len(),
            "Executing query"
        );

        conn.set_discard(true);
        let outcome = self.bounded(conn.query(sql, params)).await;
        let result = self.settle(&mut conn, outcome, "query execution");
        self.pool.release(conn);

        let rows = result?;
        debug!(
            rows = rows.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Query completed"
        );
        Ok(rows)
    }

    /// Run SQL text without parameters and return the rows affected.
    ///
    /// The text may hold several `;`-separated statements.
    pub async fn execute_statement(&self, sql: &str) -> DbResult<u64> {
        let start = Instant::now();
        let mut conn = self.pool.borrow().await?;

        debug!(connection_id = %conn.id(), sql = %sql, "Executing statement");

        conn.set_discard(true);
        let outcome = self.bounded(conn.simple_statement(sql)).await;
        let result = self.settle(&mut conn, outcome, "statement execution");
        self.pool.release(conn);

        let rows_affected = result?;
        debug!(
            rows_affected,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Statement completed"
        );
        Ok(rows_affected)
    }

    /// Run a parameterized write (INSERT, UPDATE, DELETE) and return the rows affected.
    pub async fn execute_update(&self, sql: &str, params: &[Value]) -> DbResult<u64> {
        let mut conn = self.pool.borrow().await?;

        debug!(
            connection_id = %conn.id(),
            sql = %sql,
            params = params.len(),
            "Executing write operation"
        );

        conn.set_discard(true);
        let outcome = self.bounded(conn.execute(sql, params)).await;
        let result = self.settle(&mut conn, outcome, "write operation");
        self.pool.release(conn);
        result
    }

    /// `None` when the query timeout elapsed.
    async fn bounded<T>(&self, fut: impl Future<Output = DbResult<T>>) -> Option<DbResult<T>> {
        match self.query_timeout {
            None => Some(fut.await),
            Some(limit) => timeout(limit, fut).await.ok(),
        }
    }

    /// Decide whether the connection may be reused after a finished call.
    fn settle<T>(
        &self,
        conn: &mut PooledConnection<C>,
        outcome: Option<DbResult<T>>,
        operation: &str,
    ) -> DbResult<T> {
        match outcome {
            Some(Ok(value)) => {
                conn.set_discard(false);
                Ok(value)
            }
            // Broken sessions stay marked for discard.
            Some(Err(err @ DbError::Connection { .. })) => Err(err),
            Some(Err(err)) => {
                conn.set_discard(false);
                Err(err)
            }
            None => {
                let limit = self.query_timeout.unwrap_or_default();
                warn!(
                    connection_id = %conn.id(),
                    timeout_ms = limit.as_millis() as u64,
                    "{} timed out, discarding connection",
                    operation
                );
                Err(DbError::timeout(operation, limit))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolOptions;
    use crate::db::mock::MockConnector;

    fn executor(max: u32) -> (QueryExecutor<MockConnector>, MockConnector) {
        let connector = MockConnector::new();
        let pool = ConnectionPool::from_options(
            connector.clone(),
            &PoolOptions {
                max_connections: Some(max),
                acquire_timeout_secs: Some(1),
                query_timeout_secs: None,
            },
        )
        .unwrap();
        (QueryExecutor::new(pool), connector)
    }

    #[tokio::test]
    async fn test_execute_returns_rows_and_releases() {
        let (executor, _connector) = executor(1);
        let rows = executor
            .execute("SELECT serial", &[Value::Int(1), Value::Int(2)])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("params"), Some(&Value::Int(2)));

        let status = executor.pool().status();
        assert_eq!(status.checked_out, 0);
        assert_eq!(status.idle, 1);
    }

    #[tokio::test]
    async fn test_execute_error_releases_and_passes_error_through() {
        let (executor, connector) = executor(1);
        connector.fail_on("SELECT broken");

        let err = executor.execute("SELECT broken", &[]).await.unwrap_err();
        match err {
            DbError::Database { message, .. } => assert!(message.contains("SELECT broken")),
            other => panic!("unexpected error: {other:?}"),
        }

        let status = executor.pool().status();
        assert_eq!(status.checked_out, 0);
        assert_eq!(status.idle, 1);

        // The single connection is usable again.
        executor.execute("SELECT ok", &[]).await.unwrap();
        assert_eq!(connector.opened(), 1);
    }

    #[tokio::test]
    async fn test_execute_statement_releases_on_both_paths() {
        let (executor, connector) = executor(1);
        connector.fail_on("DROP TABLE missing");

        assert_eq!(executor.execute_statement("CREATE TABLE t (x INT)").await.unwrap(), 0);
        assert!(executor.execute_statement("DROP TABLE missing").await.is_err());
        assert_eq!(executor.pool().status().checked_out, 0);
        assert_eq!(
            connector.log(),
            vec!["CREATE TABLE t (x INT)", "DROP TABLE missing"]
        );
    }

    #[tokio::test]
    async fn test_execute_update_reports_rows_affected() {
        let (executor, _connector) = executor(1);
        let affected = executor
            .execute_update("UPDATE t SET x = $1", &[Value::Int(1)])
            .await
            .unwrap();
        assert_eq!(affected, 1);
        assert_eq!(executor.pool().status().checked_out, 0);
    }

    #[tokio::test]
    async fn test_query_timeout_discards_connection() {
        let (executor, connector) = executor(1);
        let executor = executor.with_timeout(Duration::from_millis(20));

        let err = executor.execute("SLEEP 500", &[]).await.unwrap_err();
        assert!(matches!(err, DbError::Timeout { .. }));

        let status = executor.pool().status();
        assert_eq!(status.checked_out, 0);
        assert_eq!(status.idle, 0);

        executor.execute("SELECT serial", &[]).await.unwrap();
        assert_eq!(connector.opened(), 2);
    }

    #[tokio::test]
    async fn test_dropped_call_discards_connection() {
        let (executor, connector) = executor(1);
        let call = executor.execute("SLEEP 500", &[]);
        let _ = tokio::time::timeout(Duration::from_millis(20), call).await;

        let status = executor.pool().status();
        assert_eq!(status.checked_out, 0);
        assert_eq!(status.idle, 0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(connector.closed(), 1);
    }

    #[tokio::test]
    async fn test_borrow_failure_is_returned() {
        let (executor, connector) = executor(1);
        connector.fail_next_opens(1);
        let err = executor.execute("SELECT 1", &[]).await.unwrap_err();
        assert!(matches!(err, DbError::Connection { .. }));
        assert_eq!(executor.pool().status().checked_out, 0);
    }
}
