//! Driver contract
//!
//! A backend plugs into dbsql by implementing these traits. Every method
//! may return [`SqlError::BadConnection`](crate::SqlError::BadConnection) to
//! signal that the physical connection is unusable; the pool then discards
//! it instead of retrying on the same handle.

use crate::{ColumnConverter, ExecResult, Result, SqlError, Value};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Optional fast paths a connection supports.
///
/// Without them the pool runs every ad-hoc statement as
/// prepare, execute, close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DriverCapabilities {
    /// `DriverConnection::exec` runs a query without preparing it first
    pub direct_exec: bool,
    /// `DriverConnection::query` runs a query without preparing it first
    pub direct_query: bool,
}

impl DriverCapabilities {
    /// Capabilities of a connection that only supports prepared statements
    pub const fn prepare_only() -> Self {
        Self {
            direct_exec: false,
            direct_query: false,
        }
    }

    /// Capabilities of a connection that can run queries directly
    pub const fn direct() -> Self {
        Self {
            direct_exec: true,
            direct_query: true,
        }
    }
}

/// Entry point of a backend: opens physical connections.
#[async_trait]
pub trait DatabaseDriver: Send + Sync {
    /// Unique name the driver is registered under (e.g. "fakedb")
    fn name(&self) -> &'static str;

    /// Driver version
    fn version(&self) -> &'static str {
        "0.1.0"
    }

    /// Open a new physical connection for a data source name.
    async fn open(&self, dsn: &str) -> Result<Box<dyn DriverConnection>>;
}

/// One physical connection. Used by a single task at a time.
#[async_trait]
pub trait DriverConnection: Send + Sync {
    /// Fast paths this connection supports
    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities::prepare_only()
    }

    /// Prepare a statement on this connection
    async fn prepare(&mut self, query: &str) -> Result<Box<dyn DriverStatement>>;

    /// Execute a query without preparing it. Only called when
    /// `capabilities().direct_exec` is set.
    async fn exec(&mut self, query: &str, _args: &[Value]) -> Result<ExecResult> {
        Err(SqlError::NotSupported(format!("direct exec of {query:?}")))
    }

    /// Run a query without preparing it. Only called when
    /// `capabilities().direct_query` is set.
    async fn query(&mut self, query: &str, _args: &[Value]) -> Result<Box<dyn DriverRows>> {
        Err(SqlError::NotSupported(format!("direct query of {query:?}")))
    }

    /// Start a transaction on this connection
    async fn begin(&mut self) -> Result<Box<dyn DriverTransaction>>;

    /// Close the connection. Statements prepared on it have already been
    /// closed when this is called.
    async fn close(&mut self) -> Result<()>;
}

/// A statement prepared on one physical connection
#[async_trait]
pub trait DriverStatement: Send + Sync {
    /// Number of placeholders, or `None` if the driver doesn't know
    fn num_input(&self) -> Option<usize>;

    /// Converter for the placeholder at `index`. `None` applies the
    /// default conversion only.
    fn column_converter(&self, _index: usize) -> Option<ColumnConverter> {
        None
    }

    /// Execute with already converted arguments
    async fn exec(&mut self, args: &[Value]) -> Result<ExecResult>;

    /// Query with already converted arguments
    async fn query(&mut self, args: &[Value]) -> Result<Box<dyn DriverRows>>;

    /// Release the statement
    async fn close(&mut self) -> Result<()>;
}

/// Iterator over the rows of one result set
#[async_trait]
pub trait DriverRows: Send + Sync {
    /// Names of the result columns
    fn columns(&self) -> Vec<String>;

    /// Fill `dest` (one slot per column) with the next row.
    ///
    /// Returns `Ok(false)` at end of data.
    async fn next(&mut self, dest: &mut [Value]) -> Result<bool>;

    /// Release the iterator
    async fn close(&mut self) -> Result<()>;
}

/// A transaction started on a physical connection
#[async_trait]
pub trait DriverTransaction: Send + Sync {
    /// Commit the transaction
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Rollback the transaction
    async fn rollback(self: Box<Self>) -> Result<()>;
}
