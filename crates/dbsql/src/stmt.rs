//! Prepared statements
//!
//! A [`Stmt`] is a logical statement. It lazily holds one physical handle per
//! connection it has been used on; a caller gets whichever of those
//! connections is free, or a fresh connection where the statement is
//! prepared again.

use std::sync::Arc;

use async_trait::async_trait;
use dbsql_core::{ExecResult, Result, SqlError, ToSqlValue};
use parking_lot::Mutex;
use tokio::sync::RwLock;

use crate::deps::{DepId, FinalCloser};
use crate::pool::{ConnAvailability, ConnStrategy, DriverConn, Pool, StmtHandleId, retry_bad_conn};
use crate::rows::{ConnRelease, Row, Rows, RowsLease};
use crate::tx::TxInner;

/// A physical handle of the statement on one connection
#[derive(Clone)]
struct ConnStmt {
    dc: Arc<DriverConn>,
    handle: StmtHandleId,
}

struct TxBinding {
    tx: Arc<TxInner>,
    dc: Arc<DriverConn>,
    handle: StmtHandleId,
}

#[derive(Default)]
struct StmtState {
    closed: bool,
    css: Vec<ConnStmt>,
}

pub(crate) struct StmtInner {
    id: DepId,
    pool: Arc<Pool>,
    query: String,
    /// Set when construction failed; every operation returns it
    sticky_err: Option<SqlError>,
    /// Read-held while a caller sets up a connection, write-held by close
    close_lock: RwLock<()>,
    state: Mutex<StmtState>,
    tx: Option<TxBinding>,
}

/// A connection checked out for one statement execution
struct StmtLease {
    dc: Arc<DriverConn>,
    handle: StmtHandleId,
    /// False for transaction statements, whose connection isn't ours to release
    pooled: bool,
}

impl StmtInner {
    fn new(pool: Arc<Pool>, query: &str, sticky_err: Option<SqlError>, tx: Option<TxBinding>) -> Self {
        Self {
            id: DepId::next(),
            pool,
            query: query.to_string(),
            sticky_err,
            close_lock: RwLock::new(()),
            state: Mutex::new(StmtState::default()),
            tx,
        }
    }

    /// Transaction statements are pinned to one connection, so there is
    /// nothing to retry on.
    fn retries(&self) -> usize {
        match self.tx {
            Some(_) => 0,
            None => self.pool.config().bad_conn_retries(),
        }
    }

    fn handle_on(&self, dc: &Arc<DriverConn>) -> Option<StmtHandleId> {
        self.state
            .lock()
            .css
            .iter()
            .find(|cs| Arc::ptr_eq(&cs.dc, dc))
            .map(|cs| cs.handle)
    }

    async fn conn_stmt(&self, strategy: ConnStrategy) -> Result<StmtLease> {
        if let Some(err) = &self.sticky_err {
            return Err(err.clone());
        }
        if self.state.lock().closed {
            return Err(SqlError::StmtClosed);
        }

        if let Some(binding) = &self.tx {
            binding.tx.grab_conn()?;
            return Ok(StmtLease {
                dc: binding.dc.clone(),
                handle: binding.handle,
                pooled: false,
            });
        }

        if strategy == ConnStrategy::CachedOrNew {
            if let Some(lease) = self.free_conn_stmt() {
                return Ok(lease);
            }
        }

        let dc = self.pool.conn(strategy).await?;
        // A connection freed since the scan above may already have a handle.
        if let Some(handle) = self.handle_on(&dc) {
            return Ok(StmtLease {
                dc,
                handle,
                pooled: true,
            });
        }
        match dc.prepare_tracked(&self.query).await {
            Ok(handle) => {
                self.state.lock().css.push(ConnStmt {
                    dc: dc.clone(),
                    handle,
                });
                tracing::trace!(stmt = %self.id, conn = %dc.id(), "prepared on another connection");
                Ok(StmtLease {
                    dc,
                    handle,
                    pooled: true,
                })
            }
            Err(e) => {
                self.pool.put_conn(&dc, Some(&e)).await;
                Err(e)
            }
        }
    }

    /// Check out the first free connection the statement already has a
    /// handle on, dropping handles whose connection has closed.
    fn free_conn_stmt(&self) -> Option<StmtLease> {
        let candidates = self.state.lock().css.clone();
        let mut gone = Vec::new();
        let mut acquired = None;
        for cs in candidates {
            match self.pool.conn_if_free(&cs.dc) {
                ConnAvailability::Acquired => {
                    acquired = Some(cs);
                    break;
                }
                ConnAvailability::Busy => {}
                ConnAvailability::Closed => gone.push(cs.dc.id()),
            }
        }
        if !gone.is_empty() {
            self.state.lock().css.retain(|cs| !gone.contains(&cs.dc.id()));
        }
        acquired.map(|cs| StmtLease {
            dc: cs.dc,
            handle: cs.handle,
            pooled: true,
        })
    }

    async fn close(&self) -> Result<()> {
        if let Some(err) = &self.sticky_err {
            return Err(err.clone());
        }
        let _closing = self.close_lock.write().await;
        {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
        }

        match &self.tx {
            Some(binding) => {
                binding.dc.close_stmt_handles(vec![binding.handle]).await;
                Ok(())
            }
            None => self.pool.remove_dep(self.id, self.id).await,
        }
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[async_trait]
impl FinalCloser for StmtInner {
    fn dep_id(&self) -> DepId {
        self.id
    }

    fn kind(&self) -> &'static str {
        "stmt"
    }

    async fn final_close(&self) -> Result<()> {
        let css = std::mem::take(&mut self.state.lock().css);
        tracing::trace!(stmt = %self.id, handles = css.len(), "releasing statement handles");
        for cs in css {
            self.pool.note_unused_statement(&cs.dc, cs.handle).await;
        }
        Ok(())
    }
}

/// Closes the statement once the last clone of a [`Stmt`] goes away
struct StmtOwner(Arc<StmtInner>);

impl Drop for StmtOwner {
    fn drop(&mut self) {
        if self.0.sticky_err.is_some() || self.0.is_closed() {
            return;
        }
        let inner = self.0.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = inner.close().await {
                        tracing::warn!(stmt = %inner.id, error = %e, "closing dropped statement failed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(stmt = %self.0.id, "statement dropped outside a runtime; handles not released");
            }
        }
    }
}

/// A prepared statement, safe for concurrent use by multiple tasks.
///
/// Clones refer to the same statement.
#[derive(Clone)]
pub struct Stmt {
    owner: Arc<StmtOwner>,
}

impl Stmt {
    fn from_inner(inner: StmtInner) -> (Self, Arc<StmtInner>) {
        let inner = Arc::new(inner);
        (
            Self {
                owner: Arc::new(StmtOwner(inner.clone())),
            },
            inner,
        )
    }

    /// A statement already prepared on `dc`, which the caller still holds.
    pub(crate) fn prepared(pool: Arc<Pool>, query: &str, dc: Arc<DriverConn>, handle: StmtHandleId) -> Self {
        let (stmt, inner) = Self::from_inner(StmtInner::new(pool.clone(), query, None, None));
        inner.state.lock().css.push(ConnStmt { dc, handle });
        pool.add_self_dep(inner);
        stmt
    }

    pub(crate) fn for_tx(
        pool: Arc<Pool>,
        query: &str,
        tx: Arc<TxInner>,
        dc: Arc<DriverConn>,
        handle: StmtHandleId,
    ) -> Self {
        let binding = TxBinding { tx, dc, handle };
        Self::from_inner(StmtInner::new(pool, query, None, Some(binding))).0
    }

    pub(crate) fn with_error(pool: Arc<Pool>, query: &str, err: SqlError) -> Self {
        Self::from_inner(StmtInner::new(pool, query, Some(err), None)).0
    }

    fn inner(&self) -> &Arc<StmtInner> {
        &self.owner.0
    }

    pub(crate) fn pool(&self) -> &Arc<Pool> {
        &self.inner().pool
    }

    /// The query text the statement was prepared from
    pub fn sql(&self) -> &str {
        &self.inner().query
    }

    /// Number of connections the statement currently has a handle on
    pub fn connection_count(&self) -> usize {
        self.inner().state.lock().css.len()
    }

    /// Execute with the given arguments
    pub async fn exec(&self, args: &[&dyn ToSqlValue]) -> Result<ExecResult> {
        let inner = self.inner();
        let _using = inner.close_lock.read().await;
        retry_bad_conn(inner.retries(), "statement exec", move |strategy| async move {
            let lease = inner.conn_stmt(strategy).await?;
            let result = lease.dc.exec_stmt(lease.handle, args).await;
            if lease.pooled {
                inner.pool.put_conn(&lease.dc, result.as_ref().err()).await;
            }
            result
        })
        .await
    }

    /// Run the query. The statement can't finish closing until the returned
    /// rows are closed.
    pub async fn query(&self, args: &[&dyn ToSqlValue]) -> Result<Rows> {
        let inner = self.inner();
        let _using = inner.close_lock.read().await;
        retry_bad_conn(inner.retries(), "statement query", move |strategy| async move {
            let lease = inner.conn_stmt(strategy).await?;
            let result = lease.dc.query_stmt(lease.handle, args).await;

            if let Some(binding) = inner.tx.as_ref().filter(|_| !lease.pooled) {
                let rowsi = result?;
                return Ok(Rows::new(RowsLease::new(
                    inner.pool.clone(),
                    lease.dc,
                    ConnRelease::Tx(binding.tx.clone()),
                    rowsi,
                    None,
                    None,
                )));
            }

            match result {
                Ok(rowsi) => {
                    let rows = Rows::new(RowsLease::new(
                        inner.pool.clone(),
                        lease.dc,
                        ConnRelease::Pool,
                        rowsi,
                        None,
                        Some(inner.id),
                    ));
                    inner.pool.add_dep(inner.clone(), rows.id());
                    Ok(rows)
                }
                Err(e) => {
                    inner.pool.put_conn(&lease.dc, Some(&e)).await;
                    Err(e)
                }
            }
        })
        .await
    }

    pub async fn query_row(&self, args: &[&dyn ToSqlValue]) -> Row {
        Row::new(self.query(args).await)
    }

    /// Close the statement. Handles on busy connections are closed when
    /// those connections are released. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        self.inner().close().await
    }
}

impl std::fmt::Debug for Stmt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stmt")
            .field("id", &self.inner().id)
            .field("query", &self.inner().query)
            .field("closed", &self.inner().is_closed())
            .finish()
    }
}
