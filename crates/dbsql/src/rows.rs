//! Result cursors

use std::sync::Arc;

use dbsql_core::{DriverRows, DriverStatement, Result, SqlError, Value};

use crate::deps::DepId;
use crate::pool::{DriverConn, Pool};
use crate::scan::ScanDest;
use crate::tx::TxInner;

/// What happens to a cursor's connection when the cursor is done with it
pub(crate) enum ConnRelease {
    /// Hand it back to the pool
    Pool,
    /// It belongs to a transaction, which keeps it
    Tx(Arc<TxInner>),
}

impl ConnRelease {
    pub(crate) async fn release(&self, pool: &Pool, dc: &Arc<DriverConn>, err: Option<&SqlError>) {
        match self {
            ConnRelease::Pool => pool.put_conn(dc, err).await,
            ConnRelease::Tx(_) => {}
        }
    }
}

/// Everything an open cursor holds on to
pub(crate) struct RowsLease {
    pool: Arc<Pool>,
    dc: Arc<DriverConn>,
    release: ConnRelease,
    rowsi: Box<dyn DriverRows>,
    /// Ad-hoc statement that produced the rows; closed with them
    close_stmt: Option<Box<dyn DriverStatement>>,
    /// Statement that registered a dependency on these rows
    parent: Option<DepId>,
}

impl RowsLease {
    pub(crate) fn new(
        pool: Arc<Pool>,
        dc: Arc<DriverConn>,
        release: ConnRelease,
        rowsi: Box<dyn DriverRows>,
        close_stmt: Option<Box<dyn DriverStatement>>,
        parent: Option<DepId>,
    ) -> Self {
        Self {
            pool,
            dc,
            release,
            rowsi,
            close_stmt,
            parent,
        }
    }

    /// Tear down in order: driver rows, the ad-hoc statement, the parent
    /// statement's dependency, and only then the connection.
    async fn finish(mut self, rows_id: DepId) -> Result<()> {
        let err = {
            let _conn = self.dc.lock().await;
            let err = self.rowsi.close().await.err();
            if let Some(mut si) = self.close_stmt.take() {
                if let Err(e) = si.close().await {
                    tracing::warn!(conn = %self.dc.id(), error = %e, "failed to close cursor statement");
                }
            }
            err
        };

        if let Some(parent) = self.parent {
            if let Err(e) = self.pool.remove_dep(parent, rows_id).await {
                tracing::warn!(stmt = %parent, error = %e, "statement close after rows failed");
            }
        }
        self.release.release(&self.pool, &self.dc, err.as_ref()).await;

        match err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// A cursor over the result of a query.
///
/// The cursor owns its connection until it reaches the end of the data or
/// is closed. Dropping an open cursor schedules its close on the runtime;
/// call [`Rows::close`] to release the connection deterministically.
pub struct Rows {
    id: DepId,
    columns: Vec<String>,
    last_cols: Option<Vec<Value>>,
    last_err: Option<SqlError>,
    closed: bool,
    lease: Option<RowsLease>,
}

impl Rows {
    pub(crate) fn new(lease: RowsLease) -> Self {
        Self {
            id: DepId::next(),
            columns: lease.rowsi.columns(),
            last_cols: None,
            last_err: None,
            closed: false,
            lease: Some(lease),
        }
    }

    pub(crate) fn id(&self) -> DepId {
        self.id
    }

    /// Advance to the next row.
    ///
    /// Returns false at the end of the data, which also closes the cursor,
    /// or on error, which is then available from [`Rows::err`].
    pub async fn next(&mut self) -> bool {
        if self.closed || self.last_err.is_some() {
            return false;
        }
        let Some(lease) = self.lease.as_mut() else {
            return false;
        };
        if let ConnRelease::Tx(tx) = &lease.release {
            if tx.is_done() {
                self.last_err = Some(SqlError::TxDone);
                return false;
            }
        }

        let width = self.columns.len();
        let buf = self.last_cols.get_or_insert_with(|| vec![Value::Null; width]);
        let step = {
            let _conn = lease.dc.lock().await;
            lease.rowsi.next(buf).await
        };

        match step {
            Ok(true) => true,
            Ok(false) => {
                if let Err(e) = self.close().await {
                    self.last_err = Some(e);
                }
                false
            }
            Err(e) => {
                self.last_err = Some(e);
                false
            }
        }
    }

    /// The error that stopped iteration, if any. Reaching the end of the
    /// data is not an error.
    pub fn err(&self) -> Option<&SqlError> {
        self.last_err.as_ref()
    }

    /// Result column names. Available before the first `next`.
    pub fn columns(&self) -> Result<&[String]> {
        if self.closed {
            return Err(SqlError::RowsClosed);
        }
        Ok(&self.columns)
    }

    /// Copy the current row into `dest`, one destination per column.
    pub fn scan(&self, dest: &mut [&mut dyn ScanDest]) -> Result<()> {
        if self.closed {
            return Err(SqlError::RowsClosed);
        }
        if self.last_err.is_some() {
            return Err(SqlError::ScanWithoutNext);
        }
        let Some(row) = &self.last_cols else {
            return Err(SqlError::ScanWithoutNext);
        };
        if dest.len() != row.len() {
            return Err(SqlError::ScanArity {
                expected: row.len(),
                got: dest.len(),
            });
        }
        for (column, (d, value)) in dest.iter_mut().zip(row).enumerate() {
            d.scan_value(value)
                .map_err(|source| SqlError::Scan { column, source })?;
        }
        Ok(())
    }

    /// Close the cursor and release its connection. Closing twice is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.lease.take() {
            Some(lease) => lease.finish(self.id).await,
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl std::fmt::Debug for Rows {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rows")
            .field("id", &self.id)
            .field("columns", &self.columns)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Drop for Rows {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = lease.finish(id).await {
                        tracing::warn!(rows = %id, error = %e, "closing dropped rows failed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(rows = %id, "rows dropped outside a runtime; connection not released");
            }
        }
    }
}

/// The result of a single-row query.
///
/// Errors from running the query are deferred until [`Row::scan`].
pub struct Row {
    rows: Result<Rows>,
}

impl Row {
    pub(crate) fn new(rows: Result<Rows>) -> Self {
        Self { rows }
    }

    /// Scan the first row into `dest` and close the cursor.
    ///
    /// Returns [`SqlError::NoRows`] when the query produced nothing.
    /// [`RawBytes`](crate::RawBytes) destinations are rejected since the
    /// cursor is gone by the time the caller could read them.
    pub async fn scan(self, dest: &mut [&mut dyn ScanDest]) -> Result<()> {
        let mut rows = self.rows?;
        if dest.iter().any(|d| d.is_raw_bytes()) {
            close_quietly(&mut rows).await;
            return Err(SqlError::RawBytesInRow);
        }
        if !rows.next().await {
            let err = rows.err().cloned();
            close_quietly(&mut rows).await;
            return Err(err.unwrap_or(SqlError::NoRows));
        }
        let scanned = rows.scan(dest);
        let closed = rows.close().await;
        scanned?;
        closed
    }
}

impl std::fmt::Debug for Row {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Row").field("rows", &self.rows).finish()
    }
}

async fn close_quietly(rows: &mut Rows) {
    if let Err(e) = rows.close().await {
        tracing::warn!(rows = %rows.id, error = %e, "failed to close rows");
    }
}
