//! pooldb
//!
//! A bounded connection pool, a query executor and a transaction manager for
//! SQL databases (PostgreSQL, MySQL, SQLite), with a small object-mapping
//! repository on top.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod orm;

pub use config::Config;
pub use error::{DbError, DbResult};
