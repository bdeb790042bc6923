//! Transactions

use std::sync::Arc;

use dbsql_core::{DriverTransaction, ExecResult, Result, SqlError, ToSqlValue};
use parking_lot::Mutex;

use crate::pool::{DriverConn, Pool, StmtHandleId};
use crate::rows::{ConnRelease, Row, Rows};
use crate::stmt::Stmt;

struct TxState {
    done: bool,
    txi: Option<Box<dyn DriverTransaction>>,
    /// Statement handles prepared inside the transaction
    stmts: Vec<StmtHandleId>,
}

/// State shared between a [`Tx`] and the statements and cursors it created
pub(crate) struct TxInner {
    pool: Arc<Pool>,
    dc: Arc<DriverConn>,
    state: Mutex<TxState>,
}

impl TxInner {
    pub(crate) fn is_done(&self) -> bool {
        self.state.lock().done
    }

    /// The transaction's connection, as long as it hasn't finished.
    pub(crate) fn grab_conn(&self) -> Result<Arc<DriverConn>> {
        if self.is_done() {
            return Err(SqlError::TxDone);
        }
        Ok(self.dc.clone())
    }

    pub(crate) fn track_stmt(&self, handle: StmtHandleId) {
        self.state.lock().stmts.push(handle);
    }

    /// Commit or roll back, then give the connection back to the pool.
    async fn end(&self, commit: bool) -> Result<()> {
        let (txi, stmts) = {
            let mut state = self.state.lock();
            let Some(txi) = state.txi.take() else {
                return Err(SqlError::TxDone);
            };
            state.done = true;
            (txi, std::mem::take(&mut state.stmts))
        };

        let result = {
            let _conn = self.dc.lock().await;
            if commit {
                txi.commit().await
            } else {
                txi.rollback().await
            }
        };
        self.dc.close_stmt_handles(stmts).await;
        tracing::debug!(
            conn = %self.dc.id(),
            outcome = if commit { "commit" } else { "rollback" },
            ok = result.is_ok(),
            "transaction finished"
        );
        self.pool.put_conn(&self.dc, result.as_ref().err()).await;
        result
    }
}

/// An in-progress database transaction.
///
/// Every operation runs on the single connection the transaction was started
/// on. After [`Tx::commit`] or [`Tx::rollback`] all operations fail with
/// [`SqlError::TxDone`]. Dropping an unfinished transaction rolls it back in
/// the background.
pub struct Tx {
    inner: Arc<TxInner>,
}

impl Tx {
    pub(crate) fn new(pool: Arc<Pool>, dc: Arc<DriverConn>, txi: Box<dyn DriverTransaction>) -> Self {
        tracing::debug!(conn = %dc.id(), "transaction started");
        Self {
            inner: Arc::new(TxInner {
                pool,
                dc,
                state: Mutex::new(TxState {
                    done: false,
                    txi: Some(txi),
                    stmts: Vec::new(),
                }),
            }),
        }
    }

    pub async fn commit(&self) -> Result<()> {
        self.inner.end(true).await
    }

    pub async fn rollback(&self) -> Result<()> {
        self.inner.end(false).await
    }

    /// Execute a query that doesn't return rows
    pub async fn exec(&self, query: &str, args: &[&dyn ToSqlValue]) -> Result<ExecResult> {
        let dc = self.inner.grab_conn()?;
        dc.exec_direct(query, args).await
    }

    /// Run a query. The returned rows share the transaction's connection.
    pub async fn query(&self, query: &str, args: &[&dyn ToSqlValue]) -> Result<Rows> {
        let dc = self.inner.grab_conn()?;
        self.inner
            .pool
            .query_conn(dc, ConnRelease::Tx(self.inner.clone()), query, args)
            .await
    }

    pub async fn query_row(&self, query: &str, args: &[&dyn ToSqlValue]) -> Row {
        Row::new(self.query(query, args).await)
    }

    /// Prepare a statement for use within the transaction
    pub async fn prepare(&self, query: &str) -> Result<Stmt> {
        let dc = self.inner.grab_conn()?;
        let handle = dc.prepare_tracked(query).await?;
        self.inner.track_stmt(handle);
        Ok(Stmt::for_tx(
            self.inner.pool.clone(),
            query,
            self.inner.clone(),
            dc,
            handle,
        ))
    }

    /// A transaction-specific copy of an existing statement.
    ///
    /// Failures are not returned here; they stick to the returned statement
    /// and surface on its first use.
    pub async fn stmt(&self, stmt: &Stmt) -> Stmt {
        if !Arc::ptr_eq(stmt.pool(), &self.inner.pool) {
            return Stmt::with_error(
                self.inner.pool.clone(),
                stmt.sql(),
                SqlError::StmtFromOtherDatabase,
            );
        }
        match self.prepare(stmt.sql()).await {
            Ok(stmt) => stmt,
            Err(e) => Stmt::with_error(self.inner.pool.clone(), stmt.sql(), e),
        }
    }

    pub fn is_done(&self) -> bool {
        self.inner.is_done()
    }
}

impl Drop for Tx {
    fn drop(&mut self) {
        if self.inner.is_done() {
            return;
        }
        let inner = self.inner.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = inner.end(false).await {
                        if !matches!(e, SqlError::TxDone) {
                            tracing::warn!(error = %e, "rollback of dropped transaction failed");
                        }
                    }
                });
            }
            Err(_) => {
                tracing::warn!("transaction dropped outside a runtime; connection not released");
            }
        }
    }
}
