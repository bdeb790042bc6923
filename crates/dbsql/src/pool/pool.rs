//! Connection pool implementation

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use dbsql_core::{DatabaseDriver, Result, SqlError, ToSqlValue};
use parking_lot::Mutex;

use super::conn::{DriverConn, StmtHandleId};
use super::stats::PoolStats;
use crate::config::DbConfig;
use crate::deps::{DepId, DependencyGraph, FinalCloser};
use crate::invariant::invariant_violation;
use crate::rows::{ConnRelease, Rows, RowsLease};

/// Pool-side bookkeeping for one connection
#[derive(Default)]
struct ConnEntry {
    in_use: bool,
    /// Close has been requested; the connection must not be handed out again
    db_closed: bool,
    /// Statement handles to close the next time the connection is released
    on_put: Vec<StmtHandleId>,
}

struct PoolState {
    free: Vec<Arc<DriverConn>>,
    conns: HashMap<DepId, ConnEntry>,
    deps: DependencyGraph,
    closed: bool,
    max_idle: usize,
    /// First invariant violation seen in a release build, reported by close
    violation: Option<SqlError>,
}

impl PoolState {
    fn record_violation(&mut self, msg: String) {
        let err = invariant_violation(msg);
        self.violation.get_or_insert(err);
    }
}

/// Result of asking for one specific connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnAvailability {
    /// The connection was free and is now checked out by the caller
    Acquired,
    /// Someone else holds it
    Busy,
    /// It is closed or closing
    Closed,
}

/// How [`Pool::conn`] picks the connection it hands out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnStrategy {
    /// Reuse the most recently freed idle connection, opening one if none
    CachedOrNew,
    /// Skip the idle list and open a new connection
    AlwaysNew,
}

impl ConnStrategy {
    /// Strategy for attempt `attempt` (0 is the first try) of an operation
    /// allowed `retries` bad-connection retries. The last retry skips the
    /// idle list, which may hold nothing but connections the backend
    /// already dropped.
    pub(crate) fn for_attempt(attempt: usize, retries: usize) -> Self {
        if attempt > 0 && attempt == retries {
            ConnStrategy::AlwaysNew
        } else {
            ConnStrategy::CachedOrNew
        }
    }
}

/// Run `op` until it succeeds, fails with anything but a bad connection,
/// or has used up its `retries`.
///
/// `op` is one whole logical operation: it acquires its connection with
/// the strategy it's given and releases it before returning an error.
pub(crate) async fn retry_bad_conn<T, F, Fut>(retries: usize, what: &'static str, mut op: F) -> Result<T>
where
    F: FnMut(ConnStrategy) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op(ConnStrategy::for_attempt(attempt, retries)).await {
            Err(e) if e.is_bad_conn() && attempt < retries => {
                attempt += 1;
                tracing::warn!(attempt, op = what, "bad connection, retrying");
            }
            other => return other,
        }
    }
}

/// The shared state behind a [`Database`](crate::Database) handle
pub(crate) struct Pool {
    driver: Arc<dyn DatabaseDriver>,
    dsn: String,
    config: DbConfig,
    state: Mutex<PoolState>,
}

impl Pool {
    pub(crate) fn new(driver: Arc<dyn DatabaseDriver>, dsn: String, config: DbConfig) -> Arc<Self> {
        let max_idle = config.max_idle_conns();
        Arc::new(Self {
            driver,
            dsn,
            config,
            state: Mutex::new(PoolState {
                free: Vec::new(),
                conns: HashMap::new(),
                deps: DependencyGraph::new(),
                closed: false,
                max_idle,
                violation: None,
            }),
        })
    }

    pub(crate) fn driver(&self) -> &Arc<dyn DatabaseDriver> {
        &self.driver
    }

    pub(crate) fn config(&self) -> &DbConfig {
        &self.config
    }

    /// Check out a connection. With [`ConnStrategy::CachedOrNew`] that is
    /// the most recently freed one if there is any.
    pub(crate) async fn conn(self: &Arc<Self>, strategy: ConnStrategy) -> Result<Arc<DriverConn>> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(SqlError::DatabaseClosed);
            }
            if strategy == ConnStrategy::CachedOrNew {
                if let Some(dc) = state.free.pop() {
                    if let Some(entry) = state.conns.get_mut(&dc.id()) {
                        entry.in_use = true;
                    }
                    tracing::trace!(conn = %dc.id(), "reusing idle connection");
                    return Ok(dc);
                }
            }
        }

        let ci = self.driver.open(&self.dsn).await?;
        let dc = Arc::new(DriverConn::new(Arc::downgrade(self), ci));
        let closed_meanwhile = {
            let mut state = self.state.lock();
            state.conns.insert(
                dc.id(),
                ConnEntry {
                    in_use: true,
                    ..ConnEntry::default()
                },
            );
            state.deps.add_self(dc.clone());
            state.closed
        };
        tracing::debug!(conn = %dc.id(), driver = self.driver.name(), "opened connection");

        if closed_meanwhile {
            self.put_conn(&dc, None).await;
            return Err(SqlError::DatabaseClosed);
        }
        Ok(dc)
    }

    /// Check out `wanted` if it is sitting in the free list.
    pub(crate) fn conn_if_free(&self, wanted: &Arc<DriverConn>) -> ConnAvailability {
        let mut state = self.state.lock();
        let (in_use, db_closed) = match state.conns.get(&wanted.id()) {
            Some(entry) => (entry.in_use, entry.db_closed),
            None => return ConnAvailability::Closed,
        };
        if db_closed {
            return ConnAvailability::Closed;
        }
        if in_use {
            return ConnAvailability::Busy;
        }
        let Some(pos) = state.free.iter().position(|c| Arc::ptr_eq(c, wanted)) else {
            // Not in use but not free either: it is being shrunk away.
            return ConnAvailability::Busy;
        };
        state.free.swap_remove(pos);
        if let Some(entry) = state.conns.get_mut(&wanted.id()) {
            entry.in_use = true;
        }
        ConnAvailability::Acquired
    }

    /// Return a checked out connection.
    ///
    /// `err` is the outcome of the last operation on it; a bad-connection
    /// error discards the connection. Statement handles whose close was
    /// deferred while the connection was busy are closed first.
    pub(crate) async fn put_conn(&self, dc: &Arc<DriverConn>, err: Option<&SqlError>) {
        let bad = err.is_some_and(SqlError::is_bad_conn);
        loop {
            let stale = {
                let mut state = self.state.lock();
                if state.free.iter().any(|c| Arc::ptr_eq(c, dc)) {
                    state.record_violation(format!("double free of connection {}", dc.id()));
                    return;
                }
                let state = &mut *state;
                let Some(entry) = state.conns.get_mut(&dc.id()) else {
                    state.record_violation(format!("released unknown connection {}", dc.id()));
                    return;
                };
                if !entry.in_use {
                    let msg = format!("released connection {} that is not checked out", dc.id());
                    state.record_violation(msg);
                    return;
                }

                let stale = std::mem::take(&mut entry.on_put);
                if stale.is_empty() {
                    entry.in_use = false;
                    if !bad && !state.closed && state.free.len() < state.max_idle {
                        state.free.push(dc.clone());
                        tracing::trace!(conn = %dc.id(), "connection returned to idle list");
                        return;
                    }
                    None
                } else {
                    Some(stale)
                }
            };
            match stale {
                Some(handles) => dc.close_stmt_handles(handles).await,
                None => break,
            }
        }

        if bad {
            tracing::debug!(conn = %dc.id(), "discarding bad connection");
        }
        if let Err(e) = self.close_conn(dc).await {
            tracing::warn!(conn = %dc.id(), error = %e, "failed to close connection");
        }
    }

    /// Request a connection's close; the driver close runs once nothing
    /// depends on it anymore.
    pub(crate) async fn close_conn(&self, dc: &Arc<DriverConn>) -> Result<()> {
        if !dc.mark_closed() {
            return Err(SqlError::DuplicateConnClose);
        }
        let closer = {
            let mut state = self.state.lock();
            if let Some(entry) = state.conns.get_mut(&dc.id()) {
                entry.db_closed = true;
            }
            state.deps.request_close(dc.id())?
        };
        match closer {
            Some(closer) => closer.final_close().await,
            None => Ok(()),
        }
    }

    /// Called by a connection once its driver connection is gone.
    pub(crate) fn forget_conn(&self, id: DepId) {
        self.state.lock().conns.remove(&id);
    }

    /// A statement no longer needs its handle on `dc`. Close it now if the
    /// connection is idle, otherwise when the current borrower releases it.
    pub(crate) async fn note_unused_statement(&self, dc: &Arc<DriverConn>, handle: StmtHandleId) {
        {
            let mut state = self.state.lock();
            match state.conns.get_mut(&dc.id()) {
                None => return,
                Some(entry) if entry.in_use => {
                    entry.on_put.push(handle);
                    return;
                }
                Some(_) => {}
            }
        }
        dc.close_stmt_handles(vec![handle]).await;
    }

    pub(crate) fn add_dep(&self, owner: Arc<dyn FinalCloser>, dep: DepId) {
        self.state.lock().deps.add(owner, dep);
    }

    pub(crate) fn add_self_dep(&self, owner: Arc<dyn FinalCloser>) {
        self.state.lock().deps.add_self(owner);
    }

    /// Remove an edge and run the owner's final close if it was the last.
    pub(crate) async fn remove_dep(&self, owner: DepId, dep: DepId) -> Result<()> {
        let closer = self.state.lock().deps.remove(owner, dep)?;
        match closer {
            Some(closer) => closer.final_close().await,
            None => Ok(()),
        }
    }

    /// Run an ad-hoc query on a checked out connection. On failure the
    /// connection is released according to `release`.
    pub(crate) async fn query_conn(
        self: &Arc<Self>,
        dc: Arc<DriverConn>,
        release: ConnRelease,
        query: &str,
        args: &[&dyn ToSqlValue],
    ) -> Result<Rows> {
        match dc.query_direct(query, args).await {
            Ok((rowsi, close_stmt)) => Ok(Rows::new(RowsLease::new(
                self.clone(),
                dc,
                release,
                rowsi,
                close_stmt,
                None,
            ))),
            Err(e) => {
                release.release(self, &dc, Some(&e)).await;
                Err(e)
            }
        }
    }

    pub(crate) async fn set_max_idle_conns(&self, n: usize) {
        let excess = {
            let mut state = self.state.lock();
            state.max_idle = n;
            let keep = n.min(state.free.len());
            state.free.split_off(keep)
        };
        for dc in excess {
            if let Err(e) = self.close_conn(&dc).await {
                tracing::warn!(conn = %dc.id(), error = %e, "failed to close idle connection");
            }
        }
    }

    /// Close every idle connection and refuse new checkouts. Busy
    /// connections close when they are released.
    ///
    /// A misuse of the pool detected earlier (a double free in a release
    /// build) is reported here if nothing else failed.
    pub(crate) async fn close(&self) -> Result<()> {
        let (idle, violation) = {
            let mut state = self.state.lock();
            state.closed = true;
            (std::mem::take(&mut state.free), state.violation.take())
        };
        let mut first_err = None;
        for dc in idle {
            if let Err(e) = self.close_conn(&dc).await {
                tracing::warn!(conn = %dc.id(), error = %e, "failed to close connection");
                first_err.get_or_insert(e);
            }
        }
        match first_err.or(violation) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let in_use = state.conns.values().filter(|e| e.in_use).count();
        PoolStats::new(state.conns.len(), state.free.len(), in_use, state.deps.len())
    }

    pub(crate) fn dump_dependencies(&self) -> Vec<String> {
        self.state.lock().deps.dump()
    }

    /// Idle connections, most recently freed last
    #[cfg(test)]
    pub(crate) fn idle_conns(&self) -> Vec<Arc<DriverConn>> {
        self.state.lock().free.clone()
    }
}
