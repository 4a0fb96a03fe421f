//! Bounded connection pool.
//!
//! Capacity is tracked by a semaphore with one permit per connection that is
//! checked out or being opened. Borrowers wait on the semaphore in FIFO order
//! and are woken by releases; idle connections hold no permit.
//!
//! ```text
//! permits available + checked out + opening == max_size   (while open)
//! idle + checked out + opening <= max_size
//! ```
//!
//! All bookkeeping lives in one mutex that is never held across an await.

use crate::config::PoolOptions;
use crate::db::connection::{Connect, Connection, ConnectionId};
use crate::error::{DbError, DbResult};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Snapshot of the pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub max_size: usize,
    pub idle: usize,
    pub checked_out: usize,
    pub opening: usize,
    /// Connections opened over the lifetime of the pool.
    pub total_opened: u64,
    pub closed: bool,
}

struct IdleConnection<T> {
    id: ConnectionId,
    conn: T,
}

struct PoolState<T> {
    /// Most recently released last; borrowed from the back.
    idle: Vec<IdleConnection<T>>,
    checked_out: HashSet<ConnectionId>,
    opening: usize,
    total_opened: u64,
    closed: bool,
}

struct Shared<C: Connect> {
    connector: C,
    max_size: usize,
    acquire_timeout: Option<Duration>,
    permits: Semaphore,
    state: Mutex<PoolState<C::Connection>>,
    next_id: AtomicU64,
}

impl<C: Connect> Shared<C> {
    fn lock_state(&self) -> MutexGuard<'_, PoolState<C::Connection>> {
        // State updates are single assignments; a panic elsewhere cannot leave them torn.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take back a checked-out connection.
    fn give_back(&self, id: ConnectionId, conn: C::Connection, discard: bool) {
        let mut state = self.lock_state();
        if !state.checked_out.remove(&id) {
            drop(state);
            debug!(connection_id = %id, "Ignoring release of connection not checked out");
            return;
        }

        if state.closed || discard {
            let closed = state.closed;
            drop(state);
            self.permits.add_permits(1);
            if !closed {
                warn!(connection_id = %id, "Discarding connection with unknown session state");
            }
            close_in_background(id, conn);
            return;
        }

        state.idle.push(IdleConnection { id, conn });
        let idle = state.idle.len();
        drop(state);
        // Pushed before waking so the woken borrower finds it.
        self.permits.add_permits(1);
        debug!(connection_id = %id, idle, "Released connection");
    }

    /// Forget a checked-out connection that the caller closes itself.
    fn detach(&self, id: ConnectionId) {
        let mut state = self.lock_state();
        if state.checked_out.remove(&id) {
            drop(state);
            self.permits.add_permits(1);
        }
    }
}

/// Close a connection from synchronous code.
///
/// Spawns the close on the current runtime; outside a runtime the connection
/// is dropped, which tears down the socket without a goodbye.
fn close_in_background<T: Connection>(id: ConnectionId, conn: T) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(e) = conn.close().await {
                    warn!(connection_id = %id, error = %e, "Failed to close connection");
                } else {
                    debug!(connection_id = %id, "Closed connection");
                }
            });
        }
        Err(_) => drop(conn),
    }
}

/// Returns a reserved opening slot if the open does not complete.
struct OpeningReservation<'a, C: Connect> {
    shared: &'a Shared<C>,
    armed: bool,
}

impl<C: Connect> Drop for OpeningReservation<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.lock_state().opening -= 1;
            self.shared.permits.add_permits(1);
        }
    }
}

/// A bounded pool of connections produced by a [`Connect`] implementation.
///
/// Cloning is cheap and yields a handle to the same pool.
pub struct ConnectionPool<C: Connect> {
    shared: Arc<Shared<C>>,
}

impl<C: Connect> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<C: Connect> fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("status", &self.status())
            .field("acquire_timeout", &self.shared.acquire_timeout)
            .finish()
    }
}

impl<C: Connect> ConnectionPool<C> {
    /// Create a pool with `max_size` connections and the default acquire timeout.
    pub fn new(connector: C, max_size: usize) -> DbResult<Self> {
        let max_connections = u32::try_from(max_size)
            .map_err(|_| DbError::config("max_connections is too large"))?;
        Self::from_options(
            connector,
            &PoolOptions {
                max_connections: Some(max_connections),
                ..Default::default()
            },
        )
    }

    pub fn from_options(connector: C, options: &PoolOptions) -> DbResult<Self> {
        options.validate().map_err(DbError::config)?;
        let max_size = options.max_connections_or_default() as usize;
        let acquire_timeout = options.acquire_timeout();

        info!(
            max_size,
            acquire_timeout_secs = ?acquire_timeout.map(|t| t.as_secs()),
            "Created connection pool"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                connector,
                max_size,
                acquire_timeout,
                permits: Semaphore::new(max_size),
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    checked_out: HashSet::new(),
                    opening: 0,
                    total_opened: 0,
                    closed: false,
                }),
                next_id: AtomicU64::new(0),
            }),
        })
    }

    pub fn connector(&self) -> &C {
        &self.shared.connector
    }

    pub fn max_size(&self) -> usize {
        self.shared.max_size
    }

    /// Borrow a connection, waiting at most the configured acquire timeout.
    pub async fn borrow(&self) -> DbResult<PooledConnection<C>> {
        match self.shared.acquire_timeout {
            Some(limit) => self.borrow_timeout(limit).await,
            None => self.acquire().await,
        }
    }

    /// Borrow a connection, failing with [`DbError::Timeout`] after `limit`.
    pub async fn borrow_timeout(&self, limit: Duration) -> DbResult<PooledConnection<C>> {
        match tokio::time::timeout(limit, self.acquire()).await {
            Ok(result) => result,
            Err(_) => {
                debug!(timeout_ms = limit.as_millis() as u64, "Borrow timed out");
                Err(DbError::timeout("pool borrow", limit))
            }
        }
    }

    /// Borrow a connection, failing with [`DbError::Cancelled`] once `token` fires.
    pub async fn borrow_cancellable(
        &self,
        token: &CancellationToken,
    ) -> DbResult<PooledConnection<C>> {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("Borrow cancelled");
                Err(DbError::cancelled("pool borrow"))
            }
            result = self.borrow() => result,
        }
    }

    async fn acquire(&self) -> DbResult<PooledConnection<C>> {
        let shared = &*self.shared;
        let permit = shared
            .permits
            .acquire()
            .await
            .map_err(|_| DbError::PoolClosed)?;
        // From here on the permit is accounted for by `checked_out` / `opening`.
        permit.forget();

        {
            let mut state = shared.lock_state();
            if state.closed {
                drop(state);
                shared.permits.add_permits(1);
                return Err(DbError::PoolClosed);
            }
            if let Some(IdleConnection { id, conn }) = state.idle.pop() {
                state.checked_out.insert(id);
                drop(state);
                debug!(connection_id = %id, "Borrowed idle connection");
                return Ok(PooledConnection::new(id, conn, self.shared.clone()));
            }
            state.opening += 1;
        }

        let mut reservation = OpeningReservation {
            shared,
            armed: true,
        };
        let conn = match shared.connector.connect().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "Failed to open connection");
                return Err(e);
            }
        };
        let id = ConnectionId(shared.next_id.fetch_add(1, Ordering::Relaxed) + 1);

        let mut state = shared.lock_state();
        reservation.armed = false;
        state.opening -= 1;
        if state.closed {
            drop(state);
            shared.permits.add_permits(1);
            close_in_background(id, conn);
            return Err(DbError::PoolClosed);
        }
        state.checked_out.insert(id);
        state.total_opened += 1;
        let checked_out = state.checked_out.len();
        drop(state);

        debug!(connection_id = %id, checked_out, "Opened new connection");
        Ok(PooledConnection::new(id, conn, self.shared.clone()))
    }

    /// Return a borrowed connection to the pool.
    ///
    /// A connection that belongs to a different pool is left alone here and
    /// goes back to its own pool when dropped.
    pub fn release(&self, conn: PooledConnection<C>) {
        if !Arc::ptr_eq(&self.shared, &conn.pool) {
            debug!(connection_id = %conn.id, "Ignoring release of connection from another pool");
            return;
        }
        drop(conn);
    }

    /// Close the pool.
    ///
    /// Waiting borrowers fail with [`DbError::PoolClosed`], idle connections
    /// are closed now and checked-out ones when they are released. Every idle
    /// connection is attempted; the first close error is returned.
    pub async fn shutdown(&self) -> DbResult<()> {
        let idle = {
            let mut state = self.shared.lock_state();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            std::mem::take(&mut state.idle)
        };
        self.shared.permits.close();

        info!(idle = idle.len(), "Shutting down connection pool");

        let mut first_error = None;
        for IdleConnection { id, conn } in idle {
            if let Err(e) = conn.close().await {
                warn!(connection_id = %id, error = %e, "Failed to close connection");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock_state().closed
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.shared.lock_state();
        PoolStatus {
            max_size: self.shared.max_size,
            idle: state.idle.len(),
            checked_out: state.checked_out.len(),
            opening: state.opening,
            total_opened: state.total_opened,
            closed: state.closed,
        }
    }
}

/// A connection checked out of a [`ConnectionPool`].
///
/// Dropping the guard releases the connection, so it goes back even when the
/// borrower returns early or panics.
pub struct PooledConnection<C: Connect> {
    id: ConnectionId,
    conn: Option<C::Connection>,
    pool: Arc<Shared<C>>,
    discard: bool,
}

impl<C: Connect> PooledConnection<C> {
    fn new(id: ConnectionId, conn: C::Connection, pool: Arc<Shared<C>>) -> Self {
        Self {
            id,
            conn: Some(conn),
            pool,
            discard: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Close instead of reusing when this guard is released.
    ///
    /// Set while the session state is uncertain, for example while a
    /// transaction is open.
    pub fn set_discard(&mut self, discard: bool) {
        self.discard = discard;
    }

    pub fn will_discard(&self) -> bool {
        self.discard
    }

    /// Close the connection and remove it from the pool.
    pub async fn close(mut self) -> DbResult<()> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        self.pool.detach(self.id);
        debug!(connection_id = %self.id, "Closing connection");
        conn.close().await
    }

    fn live(&self) -> &C::Connection {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("connection accessed after release"),
        }
    }

    fn live_mut(&mut self) -> &mut C::Connection {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("connection accessed after release"),
        }
    }
}

impl<C: Connect> Deref for PooledConnection<C> {
    type Target = C::Connection;

    fn deref(&self) -> &Self::Target {
        self.live()
    }
}

impl<C: Connect> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.live_mut()
    }
}

impl<C: Connect> fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("discard", &self.discard)
            .finish()
    }
}

impl<C: Connect> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.give_back(self.id, conn, self.discard);
        }
    }
}
