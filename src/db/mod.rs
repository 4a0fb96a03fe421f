//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Connection traits and the sqlx-backed driver
//! - Connection pool management
//! - Query execution
//! - Scoped transactions with savepoint nesting
//! - Type mappings

pub mod connection;
pub mod driver;
pub mod executor;
#[cfg(test)]
mod mock;
pub(crate) mod params;
pub mod pool;
pub mod transaction;
pub mod types;

pub use connection::{Connect, Connection, ConnectionId};
pub use driver::{DbConnection, SqlxConnector};
pub use executor::QueryExecutor;
pub use pool::{ConnectionPool, PoolStatus, PooledConnection};
pub use transaction::{Transaction, TransactionManager};
