//! Data models shared across the crate.

pub mod connection;
pub mod value;

pub use connection::{ConnectionConfig, DatabaseType};
pub use value::{Row, Value};
