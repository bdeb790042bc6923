//! Fake connections, statements, cursors and transactions

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use dbsql_core::{
    ColumnConverter, DriverCapabilities, DriverConnection, DriverRows, DriverStatement,
    DriverTransaction, ExecResult, Result, SqlError, Value,
};

use crate::command::Command;
use crate::database::{FakeDb, fake_err};
use crate::driver::DriverCounters;

/// Per-connection counters, kept by the driver after the connection is gone
#[derive(Debug, Default)]
pub(crate) struct ConnStats {
    num_prepare: AtomicUsize,
    stmts_made: AtomicUsize,
    stmts_closed: AtomicUsize,
    closed: AtomicBool,
    /// The backend forgot this connection; every operation fails
    stale: AtomicBool,
}

impl ConnStats {
    pub(crate) fn mark_stale(&self) {
        self.stale.store(true, Ordering::SeqCst);
    }

    fn check_stale(&self) -> Result<()> {
        if self.stale.load(Ordering::SeqCst) {
            return Err(SqlError::BadConnection);
        }
        Ok(())
    }

    pub(crate) fn snapshot(&self) -> ConnectionStats {
        ConnectionStats {
            num_prepare: self.num_prepare.load(Ordering::SeqCst),
            stmts_made: self.stmts_made.load(Ordering::SeqCst),
            stmts_closed: self.stmts_closed.load(Ordering::SeqCst),
            closed: self.closed.load(Ordering::SeqCst),
        }
    }
}

/// Counters of one fake connection at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionStats {
    /// Calls to prepare
    pub num_prepare: usize,
    /// Statements successfully prepared
    pub stmts_made: usize,
    /// Statements closed
    pub stmts_closed: usize,
    /// Whether the connection was closed cleanly
    pub closed: bool,
}

impl ConnectionStats {
    /// Statements prepared and never closed
    pub fn open_statements(&self) -> usize {
        self.stmts_made.saturating_sub(self.stmts_closed)
    }
}

/// Whether a transaction is open on the connection
#[derive(Default)]
struct TxFlag(AtomicBool);

pub(crate) struct FakeConn {
    db: Option<Arc<FakeDb>>,
    driver: Arc<DriverCounters>,
    stats: Arc<ConnStats>,
    in_tx: Arc<TxFlag>,
    bad_conn: bool,
    direct: bool,
}

impl FakeConn {
    pub(crate) fn new(
        db: Arc<FakeDb>,
        driver: Arc<DriverCounters>,
        stats: Arc<ConnStats>,
        bad_conn: bool,
        direct: bool,
    ) -> Self {
        Self {
            db: Some(db),
            driver,
            stats,
            in_tx: Arc::new(TxFlag::default()),
            bad_conn,
            direct,
        }
    }

    fn db(&self) -> Result<&Arc<FakeDb>> {
        self.db.as_ref().ok_or_else(|| fake_err("connection is closed"))
    }

    fn check_close(&self) -> Result<()> {
        if self.in_tx.0.load(Ordering::SeqCst) {
            return Err(fake_err("can't close fakeConn; in a Transaction"));
        }
        if self.db.is_none() {
            return Err(fake_err("can't close fakeConn; already closed"));
        }
        let made = self.stats.stmts_made.load(Ordering::SeqCst);
        let closed = self.stats.stmts_closed.load(Ordering::SeqCst);
        if made > closed {
            return Err(fake_err(format!(
                "can't close; dangling statement(s): made {made}, closed {closed}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DriverConnection for FakeConn {
    fn capabilities(&self) -> DriverCapabilities {
        if self.direct {
            DriverCapabilities::direct()
        } else {
            DriverCapabilities::prepare_only()
        }
    }

    async fn prepare(&mut self, query: &str) -> Result<Box<dyn DriverStatement>> {
        self.stats.num_prepare.fetch_add(1, Ordering::SeqCst);
        self.stats.check_stale()?;
        let db = self.db()?.clone();
        let cmd = Command::parse(query, &db)?;
        self.stats.stmts_made.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(db = %db.name(), query, "prepared fake statement");
        Ok(Box::new(FakeStmt {
            db,
            cmd,
            stats: self.stats.clone(),
            closed: false,
        }))
    }

    async fn exec(&mut self, query: &str, args: &[Value]) -> Result<ExecResult> {
        self.stats.check_stale()?;
        let db = self.db()?;
        let cmd = Command::parse(query, db)?;
        let args = cmd.convert_args(args)?;
        cmd.exec(db, &args)
    }

    async fn query(&mut self, query: &str, args: &[Value]) -> Result<Box<dyn DriverRows>> {
        self.stats.check_stale()?;
        let db = self.db()?.clone();
        let cmd = Command::parse(query, &db)?;
        let args = cmd.convert_args(args)?;
        let (columns, rows) = cmd.query(&db, &args).await?;
        Ok(Box::new(FakeRows::new(columns, rows)))
    }

    async fn begin(&mut self) -> Result<Box<dyn DriverTransaction>> {
        self.stats.check_stale()?;
        let db = self.db()?;
        if self.bad_conn && db.next_begin_is_bad() {
            tracing::debug!(db = %db.name(), "simulating bad connection on begin");
            return Err(SqlError::BadConnection);
        }
        if self.in_tx.0.swap(true, Ordering::SeqCst) {
            return Err(fake_err("already in a transaction"));
        }
        Ok(Box::new(FakeTx {
            in_tx: self.in_tx.clone(),
        }))
    }

    async fn close(&mut self) -> Result<()> {
        match self.check_close() {
            Ok(()) => {
                self.db = None;
                self.stats.closed.store(true, Ordering::SeqCst);
                self.driver.record_close(None);
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to close fake connection");
                self.driver.record_close(Some(e.to_string()));
                Err(e)
            }
        }
    }
}

struct FakeTx {
    in_tx: Arc<TxFlag>,
}

#[async_trait]
impl DriverTransaction for FakeTx {
    async fn commit(self: Box<Self>) -> Result<()> {
        self.in_tx.0.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.in_tx.0.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeStmt {
    db: Arc<FakeDb>,
    cmd: Command,
    stats: Arc<ConnStats>,
    closed: bool,
}

impl FakeStmt {
    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(fake_err("statement has been closed"));
        }
        self.stats.check_stale()
    }
}

#[async_trait]
impl DriverStatement for FakeStmt {
    fn num_input(&self) -> Option<usize> {
        Some(self.cmd.num_input())
    }

    fn column_converter(&self, index: usize) -> Option<ColumnConverter> {
        self.cmd.converter(index)
    }

    async fn exec(&mut self, args: &[Value]) -> Result<ExecResult> {
        self.check_open()?;
        self.cmd.exec(&self.db, args)
    }

    async fn query(&mut self, args: &[Value]) -> Result<Box<dyn DriverRows>> {
        self.check_open()?;
        let (columns, rows) = self.cmd.query(&self.db, args).await?;
        Ok(Box::new(FakeRows::new(columns, rows)))
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.stats.stmts_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct FakeRows {
    columns: Vec<String>,
    rows: VecDeque<Vec<Value>>,
    closed: bool,
}

impl FakeRows {
    fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            columns,
            rows: rows.into(),
            closed: false,
        }
    }
}

#[async_trait]
impl DriverRows for FakeRows {
    fn columns(&self) -> Vec<String> {
        self.columns.clone()
    }

    async fn next(&mut self, dest: &mut [Value]) -> Result<bool> {
        if self.closed {
            return Err(fake_err("rows are closed"));
        }
        let Some(row) = self.rows.pop_front() else {
            return Ok(false);
        };
        for (slot, value) in dest.iter_mut().zip(row) {
            *slot = value;
        }
        Ok(true)
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}
