//! dbsql core - driver contract and value model
//!
//! This crate defines what a pluggable SQL backend has to provide and the
//! vocabulary shared between the backend and the pooling layer in `dbsql`:
//!
//! - `DatabaseDriver` / `DriverConnection` / `DriverStatement` / `DriverRows` /
//!   `DriverTransaction` - the driver contract
//! - `Value` - the driver-level value model
//! - `ToSqlValue` and `ColumnConverter` - argument conversion
//! - `SqlError` - the error taxonomy, including the distinguished
//!   bad-connection signal

mod convert;
mod driver;
mod error;
mod types;

pub use convert::*;
pub use driver::*;
pub use error::*;
pub use types::*;
