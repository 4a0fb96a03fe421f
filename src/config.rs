//! Configuration handling for pooldb.
//!
//! Connection settings are resolved field by field: explicit values (CLI
//! flags or a connection URL) first, then the config file, then the
//! environment (optionally extended by a `.env` file), then defaults.

use crate::error::{DbError, DbResult};
use crate::models::{ConnectionConfig, DatabaseType};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_USER: &str = "postgres";
pub const DEFAULT_DATABASE: &str = "postgres";
pub const DEFAULT_SQLITE_PATH: &str = "pooldb.db";

// Pool configuration defaults
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// Environment keys read during resolution.
pub mod env_keys {
    pub const DRIVER: &str = "DB_DRIVER";
    pub const HOST: &str = "PGHOST";
    pub const PORT: &str = "PGPORT";
    pub const USER: &str = "PGUSER";
    pub const PASSWORD: &str = "PGPASSWORD";
    pub const DATABASE: &str = "PGDATABASE";
    pub const TLS: &str = "PGTLS";
}

/// Connection pool configuration options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    /// Maximum connections in pool (default: 10)
    pub max_connections: Option<u32>,
    /// Seconds a borrow waits for capacity (default: 30, 0 waits indefinitely)
    pub acquire_timeout_secs: Option<u64>,
    /// Per-query timeout used by the executor (default: none)
    pub query_timeout_secs: Option<u64>,
}

impl PoolOptions {
    /// Get max_connections with default value.
    pub fn max_connections_or_default(&self) -> u32 {
        self.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS)
    }

    /// Get acquire_timeout with default value.
    pub fn acquire_timeout_or_default(&self) -> u64 {
        self.acquire_timeout_secs
            .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT_SECS)
    }

    /// Bound on the borrow wait; `None` means wait indefinitely.
    pub fn acquire_timeout(&self) -> Option<Duration> {
        match self.acquire_timeout_or_default() {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        self.query_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Fill unset fields from `fallback`.
    pub fn or(self, fallback: PoolOptions) -> PoolOptions {
        PoolOptions {
            max_connections: self.max_connections.or(fallback.max_connections),
            acquire_timeout_secs: self.acquire_timeout_secs.or(fallback.acquire_timeout_secs),
            query_timeout_secs: self.query_timeout_secs.or(fallback.query_timeout_secs),
        }
    }

    /// Validate pool options and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(max) = self.max_connections {
            if max == 0 {
                return Err("max_connections must be greater than 0".to_string());
            }
        }
        Ok(())
    }
}

/// Partially specified connection settings.
///
/// Every field is optional; [`ConnectionOverrides::resolve`] fills the gaps
/// from the environment and the defaults.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOverrides {
    pub driver: Option<DatabaseType>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    pub tls: Option<bool>,
}

impl ConnectionOverrides {
    /// Fill unset fields from `fallback`.
    pub fn or(self, fallback: ConnectionOverrides) -> ConnectionOverrides {
        ConnectionOverrides {
            driver: self.driver.or(fallback.driver),
            host: self.host.or(fallback.host),
            port: self.port.or(fallback.port),
            username: self.username.or(fallback.username),
            password: self.password.or(fallback.password),
            database: self.database.or(fallback.database),
            tls: self.tls.or(fallback.tls),
        }
    }

    /// Resolve against the process environment.
    pub fn resolve(self) -> DbResult<ConnectionConfig> {
        self.resolve_with(|key| std::env::var(key).ok())
    }

    /// Resolve against an arbitrary key lookup.
    pub fn resolve_with<F>(self, lookup: F) -> DbResult<ConnectionConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let driver = match self.driver {
            Some(driver) => driver,
            None => match lookup(env_keys::DRIVER) {
                Some(name) => DatabaseType::from_driver_name(&name).ok_or_else(|| {
                    DbError::config(format!("Unknown {}: {}", env_keys::DRIVER, name))
                })?,
                None => DatabaseType::PostgreSQL,
            },
        };

        let port = match self.port {
            Some(port) => port,
            None => match lookup(env_keys::PORT) {
                Some(raw) => raw.trim().parse().map_err(|_| {
                    DbError::config(format!("Invalid {}: {}", env_keys::PORT, raw))
                })?,
                None => driver.default_port().unwrap_or_default(),
            },
        };

        let default_database = match driver {
            DatabaseType::SQLite => DEFAULT_SQLITE_PATH,
            _ => DEFAULT_DATABASE,
        };

        Ok(ConnectionConfig {
            driver,
            host: self
                .host
                .or_else(|| lookup(env_keys::HOST))
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port,
            username: self
                .username
                .or_else(|| lookup(env_keys::USER))
                .unwrap_or_else(|| DEFAULT_USER.to_string()),
            password: self
                .password
                .or_else(|| lookup(env_keys::PASSWORD))
                .unwrap_or_default(),
            database: self
                .database
                .or_else(|| lookup(env_keys::DATABASE))
                .unwrap_or_else(|| default_database.to_string()),
            tls: self.tls.unwrap_or_else(|| {
                lookup(env_keys::TLS).is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
            }),
        })
    }
}

impl From<ConnectionConfig> for ConnectionOverrides {
    fn from(config: ConnectionConfig) -> Self {
        Self {
            driver: Some(config.driver),
            host: Some(config.host),
            port: Some(config.port),
            username: Some(config.username),
            password: Some(config.password),
            database: Some(config.database),
            tls: Some(config.tls),
        }
    }
}

impl fmt::Debug for ConnectionOverrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOverrides")
            .field("driver", &self.driver)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "****"))
            .field("database", &self.database)
            .field("tls", &self.tls)
            .finish()
    }
}

impl ConnectionConfig {
    /// Resolve settings from the process environment and defaults.
    pub fn from_env() -> DbResult<Self> {
        ConnectionOverrides::default().resolve()
    }

    /// Resolve settings from `lookup` and defaults.
    pub fn from_lookup<F>(lookup: F) -> DbResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        ConnectionOverrides::default().resolve_with(lookup)
    }
}

/// Contents of a JSON or YAML config file. Every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Connection URL; individual fields below take precedence over it.
    pub url: Option<String>,
    #[serde(flatten)]
    pub connection: ConnectionOverrides,
    pub pool: PoolOptions,
}

impl FileConfig {
    /// Read a config file, choosing the format from the extension.
    pub fn from_path(path: &Path) -> DbResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            DbError::config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("json") => Self::from_json(&contents),
            Some("yaml") | Some("yml") => Self::from_yaml(&contents),
            _ => Err(DbError::config(format!(
                "Unsupported config file format: {} (expected .json, .yaml or .yml)",
                path.display()
            ))),
        }
    }

    pub fn from_json(contents: &str) -> DbResult<Self> {
        serde_json::from_str(contents)
            .map_err(|e| DbError::config(format!("Invalid JSON config: {e}")))
    }

    pub fn from_yaml(contents: &str) -> DbResult<Self> {
        serde_yaml::from_str(contents)
            .map_err(|e| DbError::config(format!("Invalid YAML config: {e}")))
    }

    /// Connection fields with the URL (if any) expanded underneath them.
    fn connection_overrides(&self) -> DbResult<ConnectionOverrides> {
        let from_url = match &self.url {
            Some(url) => ConnectionConfig::from_url(url)?.into(),
            None => ConnectionOverrides::default(),
        };
        Ok(self.connection.clone().or(from_url))
    }
}

/// Variables read from a `.env` file.
///
/// Values from the file take precedence over the process environment.
#[derive(Debug, Clone, Default)]
pub struct EnvFile {
    vars: HashMap<String, String>,
}

impl EnvFile {
    pub fn load(path: &Path) -> DbResult<Self> {
        let iter = dotenvy::from_path_iter(path).map_err(|e| {
            DbError::config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let mut vars = HashMap::new();
        for item in iter {
            let (key, value) = item.map_err(|e| {
                DbError::config(format!("Invalid line in {}: {}", path.display(), e))
            })?;
            vars.insert(key, value);
        }
        Ok(Self { vars })
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.vars
            .get(key)
            .cloned()
            .or_else(|| std::env::var(key).ok())
    }
}

/// Everything needed to build a pool.
#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub connection: ConnectionConfig,
    pub pool: PoolOptions,
}

impl DatabaseSettings {
    /// Load settings from an optional `.env` file and an optional config file.
    pub fn load(env_file: Option<&Path>, config_file: Option<&Path>) -> DbResult<Self> {
        Self::load_with(
            ConnectionOverrides::default(),
            PoolOptions::default(),
            env_file,
            config_file,
        )
    }

    /// Same as [`DatabaseSettings::load`], with explicit values on top.
    pub fn load_with(
        overrides: ConnectionOverrides,
        pool: PoolOptions,
        env_file: Option<&Path>,
        config_file: Option<&Path>,
    ) -> DbResult<Self> {
        let env = match env_file {
            Some(path) => EnvFile::load(path)?,
            None => EnvFile::default(),
        };
        let file = match config_file {
            Some(path) => FileConfig::from_path(path)?,
            None => FileConfig::default(),
        };

        let connection = overrides
            .or(file.connection_overrides()?)
            .resolve_with(|key| env.get(key))?;
        let pool = pool.or(file.pool);
        pool.validate().map_err(DbError::config)?;

        Ok(Self { connection, pool })
    }
}

/// Command-line interface of the `pooldb` binary.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "pooldb",
    about = "Run SQL through a bounded connection pool",
    version
)]
pub struct Config {
    /// Connection URL (postgres://, mysql://, sqlite:)
    #[arg(long, value_name = "URL", env = "DATABASE_URL")]
    pub url: Option<String>,

    /// JSON or YAML config file
    #[arg(short = 'c', long = "config", value_name = "PATH", env = "POOLDB_CONFIG")]
    pub config_file: Option<PathBuf>,

    /// .env file with PG* variables
    #[arg(long, value_name = "PATH", env = "POOLDB_ENV_FILE")]
    pub env_file: Option<PathBuf>,

    /// Maximum pooled connections
    #[arg(long, env = "POOLDB_MAX_CONNECTIONS")]
    pub max_connections: Option<u32>,

    /// Seconds to wait for a free connection (0 waits indefinitely)
    #[arg(long, env = "POOLDB_ACQUIRE_TIMEOUT")]
    pub acquire_timeout: Option<u64>,

    /// Per-query timeout in seconds
    #[arg(long, env = "POOLDB_QUERY_TIMEOUT")]
    pub query_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "POOLDB_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "POOLDB_JSON_LOGS")]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Run a query and print each row as a JSON line
    Query {
        sql: String,
        /// Positional parameter as a JSON literal, repeatable
        #[arg(short = 'p', long = "param", value_name = "JSON")]
        params: Vec<String>,
    },
    /// Run one or more statements and print the rows affected
    Exec { sql: String },
    /// Check connectivity and print the pool status
    Ping,
}

impl Config {
    /// Parse configuration from command line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Create a default configuration (useful for testing).
    pub fn default_config() -> Self {
        Self {
            url: None,
            config_file: None,
            env_file: None,
            max_connections: None,
            acquire_timeout: None,
            query_timeout: None,
            log_level: "info".to_string(),
            json_logs: false,
            command: Command::Ping,
        }
    }

    /// Resolve database settings from flags, files and the environment.
    pub fn settings(&self) -> DbResult<DatabaseSettings> {
        let overrides = match &self.url {
            Some(url) => ConnectionConfig::from_url(url)?.into(),
            None => ConnectionOverrides::default(),
        };
        let pool = PoolOptions {
            max_connections: self.max_connections,
            acquire_timeout_secs: self.acquire_timeout,
            query_timeout_secs: self.query_timeout,
        };
        DatabaseSettings::load_with(
            overrides,
            pool,
            self.env_file.as_deref(),
            self.config_file.as_deref(),
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}
