//! In-memory connector for unit tests.
//!
//! Every connection records the SQL it receives. Statements listed with
//! [`MockConnector::fail_on`] return a database error, and `SELECT serial`
//! returns the serial number of the connection that ran it.

use crate::db::connection::{Connect, Connection};
use crate::error::{DbError, DbResult};
use crate::models::{Row, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct MockState {
    opened: AtomicUsize,
    closed: AtomicUsize,
    failing_opens: AtomicUsize,
    connect_delay: Mutex<Option<Duration>>,
    failing_sql: Mutex<HashSet<String>>,
    log: Mutex<Vec<String>>,
}

#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<MockState>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` connection attempts fail.
    pub fn fail_next_opens(&self, n: usize) {
        self.state.failing_opens.store(n, Ordering::SeqCst);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.state.connect_delay.lock().unwrap() = Some(delay);
    }

    /// Make every statement equal to `sql` fail.
    pub fn fail_on(&self, sql: &str) {
        self.state.failing_sql.lock().unwrap().insert(sql.to_string());
    }

    pub fn opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// SQL received by all connections, in order.
    pub fn log(&self) -> Vec<String> {
        self.state.log.lock().unwrap().clone()
    }
}

impl Connect for MockConnector {
    type Connection = MockConnection;

    async fn connect(&self) -> DbResult<MockConnection> {
        let delay = *self.state.connect_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let should_fail = self
            .state
            .failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(DbError::connection("mock refused connection", "retry later"));
        }
        let serial = self.state.opened.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MockConnection {
            serial,
            state: self.state.clone(),
        })
    }
}

pub struct MockConnection {
    serial: usize,
    state: Arc<MockState>,
}

impl MockConnection {
    fn run(&self, sql: &str) -> DbResult<()> {
        self.state.log.lock().unwrap().push(sql.to_string());
        if self.state.failing_sql.lock().unwrap().contains(sql) {
            return Err(DbError::database(
                format!("mock failure: {}", sql),
                None,
                "mock",
            ));
        }
        Ok(())
    }
}

impl Connection for MockConnection {
    async fn query(&mut self, sql: &str, params: &[Value]) -> DbResult<Vec<Row>> {
        self.run(sql)?;
        if let Some(rest) = sql.strip_prefix("SLEEP ") {
            let millis: u64 = rest.trim().parse().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }
        let columns: Arc<[String]> = vec!["serial".to_string(), "params".to_string()].into();
        Ok(vec![Row::new(
            columns,
            vec![
                Value::Int(self.serial as i64),
                Value::Int(params.len() as i64),
            ],
        )])
    }

    async fn execute(&mut self, sql: &str, _params: &[Value]) -> DbResult<u64> {
        self.run(sql)?;
        Ok(1)
    }

    async fn simple_statement(&mut self, sql: &str) -> DbResult<u64> {
        self.run(sql)?;
        Ok(0)
    }

    async fn close(self) -> DbResult<()> {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
