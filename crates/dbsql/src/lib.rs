//! dbsql - a generic SQL interface over pluggable drivers
//!
//! `dbsql` sits between application code and a backend implementing the
//! driver contract from `dbsql-core`. It owns the connection pool and the
//! statement, transaction and cursor lifecycles:
//!
//! - [`Database`] - a pool of connections to one data source
//! - [`Stmt`] - a prepared statement, transparently re-prepared on whatever
//!   connection runs it
//! - [`Tx`] - a transaction pinned to one connection
//! - [`Rows`] / [`Row`] - result cursors
//!
//! # Example
//!
//! ```ignore
//! let mut registry = DriverRegistry::new();
//! registry.register(Arc::new(MyDriver::default()));
//!
//! let db = Database::open(&registry, "mydriver", "dsn")?;
//! let mut rows = db.query("SELECT name FROM people WHERE age > ?", &[&30]).await?;
//! while rows.next().await {
//!     let mut name = String::new();
//!     rows.scan(&mut [&mut name])?;
//! }
//! db.close().await?;
//! ```

mod config;
mod db;
mod deps;
mod invariant;
mod null;
mod pool;
mod registry;
mod rows;
mod scan;
mod stmt;
mod tx;

pub use config::DbConfig;
pub use db::Database;
pub use null::{NullBool, NullFloat64, NullInt64, NullString};
pub use pool::PoolStats;
pub use registry::DriverRegistry;
pub use rows::{Row, Rows};
pub use scan::{RawBytes, ScanDest};
pub use stmt::Stmt;
pub use tx::Tx;

pub use dbsql_core::{
    ColumnConverter, ConvertError, DatabaseDriver, DriverCapabilities, DriverConnection,
    DriverRows, DriverStatement, DriverTransaction, ExecResult, Result, SqlError, ToSqlValue,
    Value,
};
