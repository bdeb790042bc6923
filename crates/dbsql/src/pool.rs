//! Connection pooling
//!
//! The pool owns every physical connection of a [`Database`](crate::Database).
//! A connection is either free (in the idle list) or checked out by exactly
//! one borrower: a single statement execution, a [`Rows`](crate::Rows)
//! cursor or a [`Tx`](crate::Tx). Driver I/O never happens while the pool
//! lock is held.

mod conn;
mod pool;
mod stats;


pub(crate) use conn::{DriverConn, StmtHandleId};
pub(crate) use pool::{ConnAvailability, ConnStrategy, Pool, retry_bad_conn};
pub use stats::PoolStats;
