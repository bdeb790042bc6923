//! Pooled physical connections

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Weak;

use async_trait::async_trait;
use dbsql_core::{
    DriverCapabilities, DriverConnection, DriverRows, DriverStatement, DriverTransaction,
    ExecResult, Result, SqlError, ToSqlValue, Value,
};
use tokio::sync::{Mutex, MutexGuard};

use super::pool::Pool;
use crate::deps::{DepId, FinalCloser};

/// Identity of a physical statement handle on one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct StmtHandleId(u64);

impl StmtHandleId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        StmtHandleId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for StmtHandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stmt#{}", self.0)
    }
}

pub(crate) struct ConnInner {
    ci: Option<Box<dyn DriverConnection>>,
    open_stmts: HashMap<StmtHandleId, Box<dyn DriverStatement>>,
    final_closed: bool,
}

impl ConnInner {
    fn conn(&mut self) -> Result<&mut Box<dyn DriverConnection>> {
        self.ci.as_mut().ok_or(SqlError::BadConnection)
    }
}

/// A physical connection owned by a pool.
///
/// `inner` is the per-connection lock: it is held for the duration of one
/// driver call so that a transaction's statements and cursors never drive
/// the connection concurrently.
pub(crate) struct DriverConn {
    id: DepId,
    pool: Weak<Pool>,
    capabilities: DriverCapabilities,
    closed: AtomicBool,
    inner: Mutex<ConnInner>,
}

impl DriverConn {
    pub(crate) fn new(pool: Weak<Pool>, ci: Box<dyn DriverConnection>) -> Self {
        Self {
            id: DepId::next(),
            pool,
            capabilities: ci.capabilities(),
            closed: AtomicBool::new(false),
            inner: Mutex::new(ConnInner {
                ci: Some(ci),
                open_stmts: HashMap::new(),
                final_closed: false,
            }),
        }
    }

    pub(crate) fn id(&self) -> DepId {
        self.id
    }

    /// Mark the connection closed. Returns false if it already was.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Take the per-connection lock without using the driver connection.
    pub(crate) async fn lock(&self) -> MutexGuard<'_, ConnInner> {
        self.inner.lock().await
    }

    /// Prepare a statement whose handle stays open on this connection until
    /// closed through `close_stmt_handles` or the connection goes away.
    pub(crate) async fn prepare_tracked(&self, query: &str) -> Result<StmtHandleId> {
        let mut inner = self.inner.lock().await;
        let si = inner.conn()?.prepare(query).await?;
        let handle = StmtHandleId::next();
        inner.open_stmts.insert(handle, si);
        tracing::trace!(conn = %self.id, %handle, "prepared statement");
        Ok(handle)
    }

    pub(crate) async fn exec_stmt(
        &self,
        handle: StmtHandleId,
        args: &[&dyn ToSqlValue],
    ) -> Result<ExecResult> {
        let mut inner = self.inner.lock().await;
        let si = inner
            .open_stmts
            .get_mut(&handle)
            .ok_or(SqlError::StmtClosed)?;
        exec_prepared(si.as_mut(), args).await
    }

    pub(crate) async fn query_stmt(
        &self,
        handle: StmtHandleId,
        args: &[&dyn ToSqlValue],
    ) -> Result<Box<dyn DriverRows>> {
        let mut inner = self.inner.lock().await;
        let si = inner
            .open_stmts
            .get_mut(&handle)
            .ok_or(SqlError::StmtClosed)?;
        query_prepared(si.as_mut(), args).await
    }

    /// Run an ad-hoc statement, directly if the connection supports it,
    /// otherwise through a throwaway prepared statement.
    pub(crate) async fn exec_direct(
        &self,
        query: &str,
        args: &[&dyn ToSqlValue],
    ) -> Result<ExecResult> {
        let mut inner = self.inner.lock().await;
        let ci = inner.conn()?;
        if self.capabilities.direct_exec {
            let dargs = driver_args(None, args)?;
            return ci.exec(query, &dargs).await;
        }

        let mut si = ci.prepare(query).await?;
        let result = exec_prepared(si.as_mut(), args).await;
        if let Err(e) = si.close().await {
            tracing::warn!(conn = %self.id, error = %e, "failed to close ad-hoc statement");
        }
        result
    }

    /// Run an ad-hoc query. When the statement had to be prepared, it is
    /// returned too and must be closed together with the rows.
    pub(crate) async fn query_direct(
        &self,
        query: &str,
        args: &[&dyn ToSqlValue],
    ) -> Result<(Box<dyn DriverRows>, Option<Box<dyn DriverStatement>>)> {
        let mut inner = self.inner.lock().await;
        let ci = inner.conn()?;
        if self.capabilities.direct_query {
            let dargs = driver_args(None, args)?;
            let rowsi = ci.query(query, &dargs).await?;
            return Ok((rowsi, None));
        }

        let mut si = ci.prepare(query).await?;
        match query_prepared(si.as_mut(), args).await {
            Ok(rowsi) => Ok((rowsi, Some(si))),
            Err(e) => {
                if let Err(close_err) = si.close().await {
                    tracing::warn!(conn = %self.id, error = %close_err, "failed to close ad-hoc statement");
                }
                Err(e)
            }
        }
    }

    pub(crate) async fn begin(&self) -> Result<Box<dyn DriverTransaction>> {
        let mut inner = self.inner.lock().await;
        inner.conn()?.begin().await
    }

    /// Close statement handles that are no longer wanted.
    pub(crate) async fn close_stmt_handles(&self, handles: Vec<StmtHandleId>) {
        let mut inner = self.inner.lock().await;
        if inner.final_closed {
            return;
        }
        for handle in handles {
            if let Some(mut si) = inner.open_stmts.remove(&handle) {
                if let Err(e) = si.close().await {
                    tracing::warn!(conn = %self.id, %handle, error = %e, "failed to close statement");
                }
            }
        }
    }

    /// Number of statement handles currently open on this connection
    #[cfg(test)]
    pub(crate) async fn open_statements(&self) -> usize {
        self.inner.lock().await.open_stmts.len()
    }

    /// Whether the driver connection has been released
    #[cfg(test)]
    pub(crate) async fn is_final_closed(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.final_closed && inner.ci.is_none()
    }
}

#[async_trait]
impl FinalCloser for DriverConn {
    fn dep_id(&self) -> DepId {
        self.id
    }

    fn kind(&self) -> &'static str {
        "conn"
    }

    async fn final_close(&self) -> Result<()> {
        let result = {
            let mut inner = self.inner.lock().await;
            let stmts: Vec<_> = inner.open_stmts.drain().collect();
            for (handle, mut si) in stmts {
                if let Err(e) = si.close().await {
                    tracing::warn!(conn = %self.id, %handle, error = %e, "failed to close statement");
                }
            }
            let result = match inner.ci.take() {
                Some(mut ci) => ci.close().await,
                None => Ok(()),
            };
            inner.final_closed = true;
            result
        };

        if let Some(pool) = self.pool.upgrade() {
            pool.forget_conn(self.id);
        }
        tracing::debug!(conn = %self.id, "closed connection");
        result
    }
}

fn check_arity(si: &dyn DriverStatement, got: usize) -> Result<()> {
    match si.num_input() {
        Some(expected) if expected != got => Err(SqlError::ArgumentCount { expected, got }),
        _ => Ok(()),
    }
}

/// Convert caller arguments into driver values, applying the statement's
/// per-placeholder converters when there is a statement.
pub(crate) fn driver_args(
    si: Option<&dyn DriverStatement>,
    args: &[&dyn ToSqlValue],
) -> Result<Vec<Value>> {
    args.iter()
        .enumerate()
        .map(|(index, arg)| {
            let value = arg
                .to_sql_value()
                .map_err(|source| SqlError::ArgumentConversion { index, source })?;
            match si.and_then(|si| si.column_converter(index)) {
                Some(converter) => converter
                    .convert(value)
                    .map_err(|source| SqlError::ArgumentConversion { index, source }),
                None => Ok(value),
            }
        })
        .collect()
}

async fn exec_prepared(
    si: &mut dyn DriverStatement,
    args: &[&dyn ToSqlValue],
) -> Result<ExecResult> {
    check_arity(si, args.len())?;
    let dargs = driver_args(Some(&*si), args)?;
    si.exec(&dargs).await
}

async fn query_prepared(
    si: &mut dyn DriverStatement,
    args: &[&dyn ToSqlValue],
) -> Result<Box<dyn DriverRows>> {
    check_arity(si, args.len())?;
    let dargs = driver_args(Some(&*si), args)?;
    si.query(&dargs).await
}
