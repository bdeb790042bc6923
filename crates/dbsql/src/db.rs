//! Database handle

use std::sync::Arc;

use dbsql_core::{DatabaseDriver, ExecResult, Result, SqlError, ToSqlValue};

use crate::config::DbConfig;
use crate::pool::{Pool, PoolStats, retry_bad_conn};
use crate::registry::DriverRegistry;
use crate::rows::{ConnRelease, Row, Rows};
use crate::stmt::Stmt;
use crate::tx::Tx;

/// A pool of connections to one data source.
///
/// `Database` is cheap to clone and safe for concurrent use; clones share
/// the same pool. Connections are opened lazily, so opening a database
/// never talks to the backend.
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool>,
}

impl Database {
    /// Open a database through a registered driver with default settings.
    pub fn open(registry: &DriverRegistry, driver_name: &str, dsn: &str) -> Result<Self> {
        Self::open_with_config(registry, driver_name, dsn, DbConfig::default())
    }

    pub fn open_with_config(
        registry: &DriverRegistry,
        driver_name: &str,
        dsn: &str,
        config: DbConfig,
    ) -> Result<Self> {
        let driver = registry
            .get(driver_name)
            .ok_or_else(|| SqlError::UnknownDriver(driver_name.to_string()))?;
        Ok(Self::with_driver(driver, dsn, config))
    }

    /// Open a database on a driver instance that isn't in any registry
    pub fn with_driver(driver: Arc<dyn DatabaseDriver>, dsn: &str, config: DbConfig) -> Self {
        tracing::info!(
            driver = driver.name(),
            max_idle_conns = config.max_idle_conns(),
            bad_conn_retries = config.bad_conn_retries(),
            "opening database"
        );
        Self {
            pool: Pool::new(driver, dsn.to_string(), config),
        }
    }

    fn retries(&self) -> usize {
        self.pool.config().bad_conn_retries()
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// Execute a query that doesn't return rows
    pub async fn exec(&self, query: &str, args: &[&dyn ToSqlValue]) -> Result<ExecResult> {
        retry_bad_conn(self.retries(), "exec", move |strategy| async move {
            let dc = self.pool.conn(strategy).await?;
            let result = dc.exec_direct(query, args).await;
            self.pool.put_conn(&dc, result.as_ref().err()).await;
            result
        })
        .await
    }

    /// Run a query. The connection stays checked out until the rows are
    /// closed or fully read.
    pub async fn query(&self, query: &str, args: &[&dyn ToSqlValue]) -> Result<Rows> {
        retry_bad_conn(self.retries(), "query", move |strategy| async move {
            let dc = self.pool.conn(strategy).await?;
            self.pool.query_conn(dc, ConnRelease::Pool, query, args).await
        })
        .await
    }

    /// Run a query expected to return at most one row
    pub async fn query_row(&self, query: &str, args: &[&dyn ToSqlValue]) -> Row {
        Row::new(self.query(query, args).await)
    }

    /// Prepare a statement. It is prepared right away on one connection so
    /// that invalid statements fail here.
    pub async fn prepare(&self, query: &str) -> Result<Stmt> {
        retry_bad_conn(self.retries(), "prepare", move |strategy| async move {
            let dc = self.pool.conn(strategy).await?;
            match dc.prepare_tracked(query).await {
                Ok(handle) => {
                    let stmt = Stmt::prepared(self.pool.clone(), query, dc.clone(), handle);
                    self.pool.put_conn(&dc, None).await;
                    Ok(stmt)
                }
                Err(e) => {
                    self.pool.put_conn(&dc, Some(&e)).await;
                    Err(e)
                }
            }
        })
        .await
    }

    /// Start a transaction
    pub async fn begin(&self) -> Result<Tx> {
        retry_bad_conn(self.retries(), "begin", move |strategy| async move {
            let dc = self.pool.conn(strategy).await?;
            match dc.begin().await {
                Ok(txi) => Ok(Tx::new(self.pool.clone(), dc, txi)),
                Err(e) => {
                    self.pool.put_conn(&dc, Some(&e)).await;
                    Err(e)
                }
            }
        })
        .await
    }

    /// Set the maximum number of idle connections kept for reuse. Excess
    /// idle connections are closed before this returns; 0 disables reuse.
    pub async fn set_max_idle_conns(&self, n: usize) {
        tracing::debug!(max_idle_conns = n, "updating idle connection cap");
        self.pool.set_max_idle_conns(n).await;
    }

    /// Close the database. Idle connections close now, busy ones when
    /// their borrower releases them. Later operations fail with
    /// [`SqlError::DatabaseClosed`].
    pub async fn close(&self) -> Result<()> {
        tracing::info!(driver = self.pool.driver().name(), "closing database");
        self.pool.close().await
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// The underlying driver
    pub fn driver(&self) -> Arc<dyn DatabaseDriver> {
        self.pool.driver().clone()
    }

    pub fn config(&self) -> &DbConfig {
        self.pool.config()
    }

    /// One line per outstanding dependency edge, for diagnosing leaks
    pub fn dump_dependencies(&self) -> Vec<String> {
        self.pool.dump_dependencies()
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("driver", &self.pool.driver().name())
            .field("stats", &self.pool.stats())
            .finish()
    }
}
