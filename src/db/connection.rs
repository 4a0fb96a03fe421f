//! Connection traits.
//!
//! The pool, executor and transaction manager are generic over [`Connect`],
//! so they work the same for the sqlx-backed driver and for test doubles.

use crate::error::DbResult;
use crate::models::{Row, Value};
use std::fmt;
use std::future::Future;

/// Identity of a pooled connection. Unique for the lifetime of its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) u64);

impl ConnectionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Opens new connections for a pool.
pub trait Connect: Send + Sync + 'static {
    type Connection: Connection;

    fn connect(&self) -> impl Future<Output = DbResult<Self::Connection>> + Send;
}

/// A single live database session.
pub trait Connection: Send + 'static {
    /// Run a parameterized query and return its rows.
    fn query(
        &mut self,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = DbResult<Vec<Row>>> + Send;

    /// Run a parameterized statement and return the rows affected.
    fn execute(
        &mut self,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = DbResult<u64>> + Send;

    /// Run SQL text without parameters. May contain several statements.
    fn simple_statement(&mut self, sql: &str) -> impl Future<Output = DbResult<u64>> + Send;

    fn close(self) -> impl Future<Output = DbResult<()>> + Send
    where
        Self: Sized;
}
