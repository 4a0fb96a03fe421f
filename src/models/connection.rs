//! Connection-related data models.
//!
//! This module defines the database type and the resolved connection settings
//! used to open new connections.

use crate::error::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// Supported database types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    #[serde(alias = "postgres")]
    PostgreSQL,
    /// Includes MariaDB
    #[serde(alias = "mariadb")]
    MySQL,
    SQLite,
}

impl DatabaseType {
    /// Parse database type from a connection string.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let lower = connection_string.to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::PostgreSQL)
        } else if lower.starts_with("mysql://") || lower.starts_with("mariadb://") {
            Some(Self::MySQL)
        } else if lower.starts_with("sqlite://") || lower.starts_with("sqlite:") {
            Some(Self::SQLite)
        } else {
            None
        }
    }

    /// Parse a driver name such as `postgres`, `mysql` or `sqlite`.
    pub fn from_driver_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Some(Self::PostgreSQL),
            "mysql" | "mariadb" => Some(Self::MySQL),
            "sqlite" | "sqlite3" => Some(Self::SQLite),
            _ => None,
        }
    }

    /// Get the display name for this database type.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::MySQL => "MySQL",
            Self::SQLite => "SQLite",
        }
    }

    /// Get the default port for this database type.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::PostgreSQL => Some(5432),
            Self::MySQL => Some(3306),
            Self::SQLite => None,
        }
    }

    /// Positional placeholder for the `n`-th parameter (1-based).
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            Self::MySQL => "?".to_string(),
            Self::PostgreSQL | Self::SQLite => format!("${}", n),
        }
    }

    /// Whether `INSERT ... RETURNING` / `UPDATE ... RETURNING` is available.
    pub fn supports_returning(&self) -> bool {
        !matches!(self, Self::MySQL)
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Fully resolved settings for opening a connection.
///
/// For SQLite `database` is the file path and the network fields are unused.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub driver: DatabaseType,
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Sensitive - never log
    pub password: String,
    pub database: String,
    pub tls: bool,
}

impl ConnectionConfig {
    /// Settings for a SQLite database file.
    pub fn sqlite(path: impl Into<String>) -> Self {
        Self {
            driver: DatabaseType::SQLite,
            host: String::new(),
            port: 0,
            username: String::new(),
            password: String::new(),
            database: path.into(),
            tls: false,
        }
    }

    /// Parse a connection URL.
    ///
    /// Accepts `postgres://`, `postgresql://`, `mysql://`, `mariadb://` and
    /// `sqlite:` URLs. `sslmode=require` (or `ssl-mode=required`, `tls=true`)
    /// in the query string turns TLS on.
    pub fn from_url(connection_string: &str) -> DbResult<Self> {
        let driver = DatabaseType::from_connection_string(connection_string).ok_or_else(|| {
            DbError::config(format!(
                "Unsupported connection URL scheme: {}",
                Self::mask_url(connection_string)
            ))
        })?;

        if driver == DatabaseType::SQLite {
            let rest = connection_string
                .strip_prefix("sqlite://")
                .or_else(|| connection_string.strip_prefix("sqlite:"))
                .unwrap_or(connection_string);
            let path = rest.split('?').next().unwrap_or_default();
            if path.is_empty() {
                return Err(DbError::config("SQLite requires a database file path"));
            }
            return Ok(Self::sqlite(path));
        }

        let url = Url::parse(connection_string)
            .map_err(|e| DbError::config(format!("Invalid URL: {e}")))?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| DbError::config("Connection URL has no host"))?
            .to_string();
        let port = url
            .port()
            .or_else(|| driver.default_port())
            .unwrap_or_default();
        let database = url
            .path()
            .trim_start_matches('/')
            .split('/')
            .next()
            .filter(|s| !s.is_empty())
            .map(String::from)
            .unwrap_or_else(|| crate::config::DEFAULT_DATABASE.to_string());
        let tls = url.query_pairs().any(|(k, v)| {
            let key = k.to_ascii_lowercase();
            let value = v.to_ascii_lowercase();
            match key.as_str() {
                "sslmode" | "ssl-mode" => {
                    matches!(
                        value.as_str(),
                        "require" | "required" | "verify-ca" | "verify_ca" | "verify-full"
                            | "verify_identity"
                    )
                }
                "tls" | "ssl" => value == "true",
                _ => false,
            }
        });

        Ok(Self {
            driver,
            host,
            port,
            username: url.username().to_string(),
            password: url.password().unwrap_or_default().to_string(),
            database,
            tls,
        })
    }

    /// Loggable description of the target (no credentials).
    pub fn display_target(&self) -> String {
        match self.driver {
            DatabaseType::SQLite => format!("sqlite:{}", self.database),
            _ => format!(
                "{}@{}:{}/{}",
                self.username, self.host, self.port, self.database
            ),
        }
    }

    /// Mask the password in a connection URL.
    pub fn mask_url(connection_string: &str) -> String {
        if let Some(at_pos) = connection_string.find('@') {
            if let Some(colon_pos) = connection_string[..at_pos].rfind(':') {
                let prefix = &connection_string[..colon_pos + 1];
                if !connection_string[colon_pos + 1..at_pos].starts_with("//") {
                    let suffix = &connection_string[at_pos..];
                    return format!("{}****{}", prefix, suffix);
                }
            }
        }
        connection_string.to_string()
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let password = if self.password.is_empty() { "" } else { "****" };
        f.debug_struct("ConnectionConfig")
            .field("driver", &self.driver)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &password)
            .field("database", &self.database)
            .field("tls", &self.tls)
            .finish()
    }
}
