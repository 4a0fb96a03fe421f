//! pooldb - Main entry point.
//!
//! Runs SQL from the command line through the connection pool and executor.

use clap::Parser;
use pooldb::config::{Command, Config};
use pooldb::db::{ConnectionPool, QueryExecutor, SqlxConnector};
use pooldb::models::Value;
use pooldb::{DbError, DbResult};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    // Logs go to stderr so command output stays machine readable.
    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    let settings = config.settings()?;
    info!(
        driver = %settings.connection.driver,
        database = %settings.connection.display_target(),
        max_connections = settings.pool.max_connections_or_default(),
        "Starting pooldb v{}",
        env!("CARGO_PKG_VERSION")
    );

    let connector = SqlxConnector::new(settings.connection);
    let pool = ConnectionPool::from_options(connector, &settings.pool)?;
    let mut executor = QueryExecutor::new(pool.clone());
    if let Some(limit) = settings.pool.query_timeout() {
        executor = executor.with_timeout(limit);
    }

    let result = tokio::select! {
        result = run(&executor, &config.command) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            Err(DbError::cancelled(command_name(&config.command)))
        }
    };

    if let Err(e) = pool.shutdown().await {
        error!(error = %e, "Pool shutdown failed");
    }

    if let Err(e) = result {
        error!(error = %e, "Command failed");
        if let Some(suggestion) = e.suggestion() {
            eprintln!("{}\n  hint: {}", e, suggestion);
        } else {
            eprintln!("{}", e);
        }
        std::process::exit(1);
    }

    Ok(())
}

fn command_name(command: &Command) -> &'static str {
    match command {
        Command::Query { .. } => "query",
        Command::Exec { .. } => "exec",
        Command::Ping => "ping",
    }
}

async fn run(executor: &QueryExecutor<SqlxConnector>, command: &Command) -> DbResult<()> {
    match command {
        Command::Query { sql, params } => {
            let params = params
                .iter()
                .map(String::as_str)
                .map(parse_param)
                .collect::<DbResult<Vec<_>>>()?;
            let rows = executor.execute(sql, &params).await?;
            for row in &rows {
                println!("{}", serde_json::to_string(row)?);
            }
            info!(rows = rows.len(), "Query finished");
        }
        Command::Exec { sql } => {
            let rows_affected = executor.execute_statement(sql).await?;
            println!("{}", rows_affected);
        }
        Command::Ping => {
            executor.execute("SELECT 1", &[]).await?;
            let status = executor.pool().status();
            println!("{}", serde_json::to_string(&status)?);
        }
    }
    Ok(())
}

/// Parse a `--param` JSON literal. Bare words are taken as text.
fn parse_param(raw: &str) -> DbResult<Value> {
    match serde_json::from_str(raw) {
        Ok(json) => Ok(Value::from_json(json)),
        Err(_) if !raw.trim_start().starts_with(['{', '[', '"']) => {
            Ok(Value::Text(raw.to_string()))
        }
        Err(e) => Err(DbError::invalid_input(format!(
            "Invalid parameter {}: {}",
            raw, e
        ))),
    }
}
