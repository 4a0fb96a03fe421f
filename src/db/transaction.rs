//! Transaction management.
//!
//! [`TransactionManager::transaction`] borrows a connection, wraps the
//! caller's logic in `BEGIN` / `COMMIT` and rolls back when anything fails.
//! [`Transaction::nested`] opens a savepoint scope on the same connection.
//! Savepoint names come from a per-transaction counter, so scopes can nest to
//! any depth without clobbering each other.
//!
//! Logic is passed as a closure returning a boxed future, the same shape
//! sqlx uses for `Connection::transaction`:
//!
//! ```no_run
//! # use pooldb::db::{TransactionManager, SqlxConnector};
//! # async fn example(manager: TransactionManager<SqlxConnector>) -> pooldb::DbResult<()> {
//! manager
//!     .transaction(|tx| {
//!         Box::pin(async move {
//!             tx.execute_statement("INSERT INTO audit (event) VALUES ('a')").await?;
//!             tx.nested(|inner| {
//!                 Box::pin(async move {
//!                     inner.execute_statement("INSERT INTO audit (event) VALUES ('b')").await
//!                 })
//!             })
//!             .await?;
//!             Ok::<_, pooldb::DbError>(())
//!         })
//!     })
//!     .await
//! # }
//! ```

use crate::db::connection::{Connect, Connection};
use crate::db::pool::ConnectionPool;
use crate::error::{DbError, DbResult};
use crate::models::{Row, Value};
use futures_util::future::BoxFuture;
use std::fmt;
use tracing::{debug, info};

/// Runs caller logic inside database transactions.
pub struct TransactionManager<C: Connect> {
    pool: ConnectionPool<C>,
}

impl<C: Connect> Clone for TransactionManager<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
        }
    }
}

impl<C: Connect> fmt::Debug for TransactionManager<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("pool", &self.pool)
            .finish()
    }
}

impl<C: Connect> TransactionManager<C> {
    pub fn new(pool: ConnectionPool<C>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &ConnectionPool<C> {
        &self.pool
    }

    /// Run `logic` in a top-level transaction.
    ///
    /// Commits when `logic` succeeds. Otherwise rolls back and returns the
    /// original error; a failing rollback is logged and swallowed. The
    /// connection is released exactly once either way, and is closed rather
    /// than reused if the transaction could not be ended cleanly.
    pub async fn transaction<R, F>(&self, logic: F) -> DbResult<R>
    where
        R: Send,
        F: for<'t> FnOnce(&'t mut Transaction<'_, C::Connection>) -> BoxFuture<'t, DbResult<R>>
            + Send,
    {
        let mut conn = self.pool.borrow().await?;
        let connection_id = conn.id();
        // Until COMMIT or ROLLBACK succeeds the session may hold an open transaction.
        conn.set_discard(true);

        let mut savepoints = 0;
        let mut poisoned = false;
        let (result, clean) = {
            let mut tx = Transaction {
                conn: &mut *conn,
                savepoints: &mut savepoints,
                poisoned: &mut poisoned,
                depth: 0,
            };
            run_scope(&mut tx, &Scope::Top, logic).await
        };

        if clean {
            conn.set_discard(false);
        }
        self.pool.release(conn);

        match &result {
            Ok(_) => info!(connection_id = %connection_id, "Transaction committed"),
            Err(e) => info!(connection_id = %connection_id, error = %e, "Transaction rolled back"),
        }
        result
    }
}

/// A live transaction scope, handed to transaction logic.
///
/// The connection is only reachable through this handle while the scope runs.
pub struct Transaction<'c, T: Connection> {
    conn: &'c mut T,
    savepoints: &'c mut u32,
    /// Set once a savepoint could not be rolled back. The session state is
    /// unknown from then on, so no enclosing scope may commit.
    poisoned: &'c mut bool,
    depth: u32,
}

impl<T: Connection> Transaction<'_, T> {
    /// Run a parameterized query inside the transaction.
    pub async fn query(&mut self, sql: &str, params: &[Value]) -> DbResult<Vec<Row>> {
        debug!(sql = %sql, params = params.len(), depth = self.depth, "Transaction query");
        self.conn.query(sql, params).await
    }

    /// Run a parameterized write inside the transaction.
    pub async fn execute(&mut self, sql: &str, params: &[Value]) -> DbResult<u64> {
        debug!(sql = %sql, params = params.len(), depth = self.depth, "Transaction write");
        self.conn.execute(sql, params).await
    }

    /// Run SQL text without parameters inside the transaction.
    pub async fn execute_statement(&mut self, sql: &str) -> DbResult<u64> {
        debug!(sql = %sql, depth = self.depth, "Transaction statement");
        self.conn.simple_statement(sql).await
    }

    /// The underlying connection.
    pub fn connection(&mut self) -> &mut T {
        &mut *self.conn
    }

    /// 0 for the top-level scope, +1 per savepoint.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn is_nested(&self) -> bool {
        self.depth > 0
    }

    /// Run `logic` in a savepoint scope on this transaction's connection.
    ///
    /// Success releases the savepoint; failure rolls back to it and returns
    /// the original error, leaving the enclosing scope usable. If rolling
    /// back to the savepoint fails as well, the whole transaction is rolled
    /// back when its top-level logic finishes and the connection is closed.
    pub async fn nested<R, F>(&mut self, logic: F) -> DbResult<R>
    where
        R: Send,
        F: for<'t> FnOnce(&'t mut Transaction<'_, T>) -> BoxFuture<'t, DbResult<R>> + Send,
    {
        *self.savepoints += 1;
        let scope = Scope::Savepoint(format!("sp_{}", *self.savepoints));
        let mut inner = Transaction {
            conn: &mut *self.conn,
            savepoints: &mut *self.savepoints,
            poisoned: &mut *self.poisoned,
            depth: self.depth + 1,
        };
        let (result, clean) = run_scope(&mut inner, &scope, logic).await;
        if !clean {
            *self.poisoned = true;
        }
        result
    }
}

impl<T: Connection> fmt::Debug for Transaction<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("depth", &self.depth)
            .field("savepoints", &*self.savepoints)
            .field("poisoned", &*self.poisoned)
            .finish()
    }
}

enum Scope {
    Top,
    Savepoint(String),
}

impl Scope {
    fn begin_sql(&self) -> String {
        match self {
            Self::Top => "BEGIN".to_string(),
            Self::Savepoint(name) => format!("SAVEPOINT {}", name),
        }
    }

    fn commit_sql(&self) -> String {
        match self {
            Self::Top => "COMMIT".to_string(),
            Self::Savepoint(name) => format!("RELEASE SAVEPOINT {}", name),
        }
    }

    fn rollback_sql(&self) -> String {
        match self {
            Self::Top => "ROLLBACK".to_string(),
            Self::Savepoint(name) => format!("ROLLBACK TO SAVEPOINT {}", name),
        }
    }
}

/// Begin, run, then commit or roll back one scope.
///
/// Returns the outcome and whether the scope ended cleanly (committed or
/// rolled back without error, with no failed savepoint rollback inside it).
/// A scope containing a failed savepoint rollback is never committed.
async fn run_scope<T, R, F>(
    tx: &mut Transaction<'_, T>,
    scope: &Scope,
    logic: F,
) -> (DbResult<R>, bool)
where
    T: Connection,
    F: for<'t> FnOnce(&'t mut Transaction<'_, T>) -> BoxFuture<'t, DbResult<R>>,
{
    let outcome = match tx.conn.simple_statement(&scope.begin_sql()).await {
        Ok(_) => match logic(&mut *tx).await {
            Ok(_) if *tx.poisoned => Err(DbError::internal(
                "A savepoint rollback failed; the transaction was aborted",
            )),
            Ok(value) => tx
                .conn
                .simple_statement(&scope.commit_sql())
                .await
                .map(|_| value),
            Err(e) => Err(e),
        },
        Err(e) => Err(e),
    };

    match outcome {
        Ok(value) => {
            debug!(depth = tx.depth, "Scope committed");
            (Ok(value), true)
        }
        Err(err) => match tx.conn.simple_statement(&scope.rollback_sql()).await {
            Ok(_) => {
                debug!(depth = tx.depth, error = %err, "Scope rolled back");
                (Err(err), !*tx.poisoned)
            }
            Err(rollback_err) => {
                debug!(
                    depth = tx.depth,
                    error = %err,
                    rollback_error = %rollback_err,
                    "Rollback failed"
                );
                (Err(err), false)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolOptions;
    use crate::db::mock::MockConnector;

    fn explode() -> DbResult<()> {
        panic!("logic panicked")
    }

    fn manager() -> (TransactionManager<MockConnector>, MockConnector) {
        let connector = MockConnector::new();
        let pool = ConnectionPool::from_options(
            connector.clone(),
            &PoolOptions {
                max_connections: Some(1),
                acquire_timeout_secs: Some(1),
                query_timeout_secs: None,
            },
        )
        .unwrap();
        (TransactionManager::new(pool), connector)
    }

    #[tokio::test]
    async fn test_commit_path() {
        let (manager, connector) = manager();
        let value = manager
            .transaction(|tx| {
                Box::pin(async move {
                    assert_eq!(tx.depth(), 0);
                    assert!(!tx.is_nested());
                    tx.execute_statement("INSERT a").await?;
                    Ok::<_, DbError>(42)
                })
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(connector.log(), vec!["BEGIN", "INSERT a", "COMMIT"]);
        let status = manager.pool().status();
        assert_eq!(status.checked_out, 0);
        assert_eq!(status.idle, 1);
    }

    #[tokio::test]
    async fn test_logic_error_rolls_back_and_returns_original_error() {
        let (manager, connector) = manager();
        let err = manager
            .transaction(|tx| {
                Box::pin(async move {
                    tx.execute_statement("INSERT a").await?;
                    Err::<(), _>(DbError::invalid_input("business rule violated"))
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::InvalidInput { .. }));
        assert_eq!(connector.log(), vec!["BEGIN", "INSERT a", "ROLLBACK"]);
        assert_eq!(manager.pool().status().idle, 1);
    }

    #[tokio::test]
    async fn test_failing_rollback_is_swallowed_and_connection_discarded() {
        let (manager, connector) = manager();
        connector.fail_on("ROLLBACK");

        let err = manager
            .transaction(|_tx| {
                Box::pin(async move { Err::<(), _>(DbError::invalid_input("boom")) })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::InvalidInput { .. }));
        let status = manager.pool().status();
        assert_eq!(status.checked_out, 0);
        assert_eq!(status.idle, 0);
    }

    #[tokio::test]
    async fn test_begin_failure_takes_rollback_path() {
        let (manager, connector) = manager();
        connector.fail_on("BEGIN");

        let err = manager
            .transaction(|_tx| Box::pin(async move { Ok::<_, DbError>(()) }))
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::Database { .. }));
        assert_eq!(connector.log(), vec!["BEGIN", "ROLLBACK"]);
        assert_eq!(manager.pool().status().checked_out, 0);
    }

    #[tokio::test]
    async fn test_commit_failure_takes_rollback_path() {
        let (manager, connector) = manager();
        connector.fail_on("COMMIT");

        let err = manager
            .transaction(|_tx| Box::pin(async move { Ok::<_, DbError>(()) }))
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::Database { .. }));
        assert_eq!(connector.log(), vec!["BEGIN", "COMMIT", "ROLLBACK"]);
    }

    #[tokio::test]
    async fn test_nested_scopes_use_unique_savepoints() {
        let (manager, connector) = manager();
        manager
            .transaction(|tx| {
                Box::pin(async move {
                    tx.nested(|a| {
                        Box::pin(async move {
                            assert_eq!(a.depth(), 1);
                            a.nested(|b| {
                                Box::pin(async move {
                                    assert_eq!(b.depth(), 2);
                                    b.execute_statement("INSERT deep").await
                                })
                            })
                            .await
                        })
                    })
                    .await?;
                    tx.nested(|c| Box::pin(async move { c.execute_statement("INSERT c").await }))
                        .await?;
                    Ok::<_, DbError>(())
                })
            })
            .await
            .unwrap();

        assert_eq!(
            connector.log(),
            vec![
                "BEGIN",
                "SAVEPOINT sp_1",
                "SAVEPOINT sp_2",
                "INSERT deep",
                "RELEASE SAVEPOINT sp_2",
                "RELEASE SAVEPOINT sp_1",
                "SAVEPOINT sp_3",
                "INSERT c",
                "RELEASE SAVEPOINT sp_3",
                "COMMIT",
            ]
        );
    }

    #[tokio::test]
    async fn test_nested_failure_rolls_back_to_savepoint_only() {
        let (manager, connector) = manager();
        connector.fail_on("INSERT y");

        manager
            .transaction(|tx| {
                Box::pin(async move {
                    tx.execute_statement("INSERT x").await?;
                    let nested = tx
                        .nested(|inner| {
                            Box::pin(async move { inner.execute_statement("INSERT y").await })
                        })
                        .await;
                    assert!(nested.is_err());
                    Ok::<_, DbError>(())
                })
            })
            .await
            .unwrap();

        assert_eq!(
            connector.log(),
            vec![
                "BEGIN",
                "INSERT x",
                "SAVEPOINT sp_1",
                "INSERT y",
                "ROLLBACK TO SAVEPOINT sp_1",
                "COMMIT",
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_savepoint_rollback_aborts_outer_scope_and_discards() {
        let (manager, connector) = manager();
        connector.fail_on("INSERT y");
        connector.fail_on("ROLLBACK TO SAVEPOINT sp_1");

        let err = manager
            .transaction(|tx| {
                Box::pin(async move {
                    let nested = tx
                        .nested(|inner| {
                            Box::pin(async move { inner.execute_statement("INSERT y").await })
                        })
                        .await;
                    // The body's own error, not the rollback error.
                    match nested {
                        Err(DbError::Database { message, .. }) => {
                            assert!(message.contains("INSERT y"))
                        }
                        other => panic!("unexpected nested result: {other:?}"),
                    }
                    // Outer logic ignores the failure and tries to finish.
                    Ok::<_, DbError>(())
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::Internal { .. }));
        assert_eq!(
            connector.log(),
            vec![
                "BEGIN",
                "SAVEPOINT sp_1",
                "INSERT y",
                "ROLLBACK TO SAVEPOINT sp_1",
                "ROLLBACK",
            ]
        );
        let status = manager.pool().status();
        assert_eq!(status.checked_out, 0);
        assert_eq!(status.idle, 0);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(connector.closed(), 1);
    }

    #[tokio::test]
    async fn test_failed_deep_savepoint_rollback_returns_body_error() {
        let (manager, connector) = manager();
        connector.fail_on("INSERT deep");
        connector.fail_on("ROLLBACK TO SAVEPOINT sp_2");

        let err = manager
            .transaction(|tx| {
                Box::pin(async move {
                    tx.nested(|a| {
                        Box::pin(async move {
                            a.nested(|b| {
                                Box::pin(async move { b.execute_statement("INSERT deep").await })
                            })
                            .await
                        })
                    })
                    .await?;
                    Ok::<_, DbError>(())
                })
            })
            .await
            .unwrap_err();

        match err {
            DbError::Database { message, .. } => assert!(message.contains("INSERT deep")),
            other => panic!("unexpected error: {other:?}"),
        }
        let log = connector.log();
        assert!(!log.iter().any(|sql| sql == "COMMIT" || sql.starts_with("RELEASE")));
        assert_eq!(log.last().map(String::as_str), Some("ROLLBACK"));
        assert_eq!(manager.pool().status().idle, 0);
    }

    #[tokio::test]
    async fn test_nested_uses_the_same_connection() {
        let (manager, connector) = manager();
        manager
            .transaction(|tx| {
                Box::pin(async move {
                    let outer = tx.query("SELECT serial", &[]).await?;
                    let inner = tx
                        .nested(|inner| {
                            Box::pin(async move { inner.query("SELECT serial", &[]).await })
                        })
                        .await?;
                    assert_eq!(outer[0].get("serial"), inner[0].get("serial"));
                    Ok::<_, DbError>(())
                })
            })
            .await
            .unwrap();
        assert_eq!(connector.opened(), 1);
    }

    #[tokio::test]
    async fn test_panicking_logic_discards_connection() {
        let (manager, connector) = manager();
        let handle = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .transaction(|_tx| Box::pin(async move { explode() }))
                    .await
            })
        };
        assert!(handle.await.is_err());

        let status = manager.pool().status();
        assert_eq!(status.checked_out, 0);
        assert_eq!(status.idle, 0);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(connector.closed(), 1);
    }
}
