//! In-memory fake driver for dbsql
//!
//! `FakeDriver` implements the dbsql driver contract on top of shared
//! in-memory tables and a pipe-separated query language:
//!
//! ```text
//! WIPE
//! CREATE|people|name=string,age=int32,photo=blob
//! INSERT|people|name=Alice,age=?
//! SELECT|people|age,name|name=?
//! ```
//!
//! It records how many connections and statements were opened and closed,
//! and refuses to close a connection that still has statements or a
//! transaction open, which makes it useful for checking that a pool cleans
//! up after itself.
//!
//! Data source names are `<dbname>[;badConn][;direct]`.

mod command;
mod connection;
mod database;
mod driver;

pub use connection::ConnectionStats;
pub use database::ColumnType;
pub use driver::{DRIVER_NAME, DsnOptions, FakeDriver};
