//! Fake driver implementation

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dbsql_core::{DatabaseDriver, DriverConnection, Result, SqlError};
use parking_lot::Mutex;

use crate::connection::{ConnStats, ConnectionStats, FakeConn};
use crate::database::FakeDb;

/// Name the driver registers under
pub const DRIVER_NAME: &str = "fakedb";

/// Options parsed from a data source name: `<dbname>[;badConn][;direct]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DsnOptions {
    /// Name of the shared in-memory database
    pub name: String,
    /// Every other `begin` fails with a bad-connection error
    pub bad_conn: bool,
    /// Connections run ad-hoc queries without preparing them
    pub direct: bool,
}

impl DsnOptions {
    pub fn parse(dsn: &str) -> Result<Self> {
        let mut parts = dsn.split(';');
        let name = parts.next().unwrap_or_default();
        if name.is_empty() {
            return Err(SqlError::Configuration(format!(
                "fakedb: data source {dsn:?} has no database name"
            )));
        }
        let mut options = DsnOptions {
            name: name.to_string(),
            bad_conn: false,
            direct: false,
        };
        for option in parts {
            match option {
                "badConn" => options.bad_conn = true,
                "direct" => options.direct = true,
                other => {
                    return Err(SqlError::Configuration(format!(
                        "fakedb: unknown data source option {other:?}"
                    )));
                }
            }
        }
        Ok(options)
    }
}

/// Counters shared between the driver and its connections
#[derive(Default)]
pub(crate) struct DriverCounters {
    opens: AtomicUsize,
    closes: AtomicUsize,
    /// Opens still to be refused with a bad-connection error
    failing_opens: AtomicUsize,
    close_errors: Mutex<Vec<String>>,
    conns: Mutex<Vec<Arc<ConnStats>>>,
}

impl DriverCounters {
    /// Only clean closes count; failures are kept for inspection
    pub(crate) fn record_close(&self, error: Option<String>) {
        match error {
            None => {
                self.closes.fetch_add(1, Ordering::SeqCst);
            }
            Some(e) => self.close_errors.lock().push(e),
        }
    }
}

/// In-memory driver with a tiny pipe-separated query language.
///
/// Every connection opened with the same database name shares its tables.
/// The driver keeps counters of connections and statements so callers can
/// check for leaks.
#[derive(Default)]
pub struct FakeDriver {
    dbs: Mutex<HashMap<String, Arc<FakeDb>>>,
    counters: Arc<DriverCounters>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn database(&self, name: &str) -> Arc<FakeDb> {
        self.dbs
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(FakeDb::new(name)))
            .clone()
    }

    /// Connections opened so far
    pub fn open_count(&self) -> usize {
        self.counters.opens.load(Ordering::SeqCst)
    }

    /// Connections closed cleanly so far
    pub fn close_count(&self) -> usize {
        self.counters.closes.load(Ordering::SeqCst)
    }

    /// Messages of connection closes that failed
    pub fn close_errors(&self) -> Vec<String> {
        self.counters.close_errors.lock().clone()
    }

    /// Counters of every connection ever opened, in open order
    pub fn connection_stats(&self) -> Vec<ConnectionStats> {
        self.counters
            .conns
            .lock()
            .iter()
            .map(|stats| stats.snapshot())
            .collect()
    }

    /// Total prepare calls across all connections
    pub fn num_prepares(&self) -> usize {
        self.connection_stats().iter().map(|s| s.num_prepare).sum()
    }

    /// Simulate a backend restart: every connection opened so far fails
    /// with a bad-connection error from now on. Closing them still works.
    pub fn restart_backend(&self) {
        let conns = self.counters.conns.lock();
        for stats in conns.iter() {
            stats.mark_stale();
        }
        tracing::debug!(stale = conns.len(), "simulated backend restart");
    }

    /// Refuse the next `n` opens with a bad-connection error
    pub fn fail_next_opens(&self, n: usize) {
        self.counters.failing_opens.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl DatabaseDriver for FakeDriver {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    #[tracing::instrument(skip(self))]
    async fn open(&self, dsn: &str) -> Result<Box<dyn DriverConnection>> {
        let options = DsnOptions::parse(dsn)?;
        let refused = self
            .counters
            .failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            tracing::debug!(db = %options.name, "simulating bad connection on open");
            return Err(SqlError::BadConnection);
        }
        let db = self.database(&options.name);
        let stats = Arc::new(ConnStats::default());
        self.counters.conns.lock().push(stats.clone());
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(db = %options.name, direct = options.direct, "fake connection opened");

        Ok(Box::new(FakeConn::new(
            db,
            self.counters.clone(),
            stats,
            options.bad_conn,
            options.direct,
        )))
    }
}
