//! dbsql behaviour test suite
//!
//! Exercises the connection pool, prepared statements, transactions and
//! cursors of `dbsql` against the in-memory `dbsql-fakedb` driver. Most tests
//! run twice: once on connections that must prepare every statement, and
//! once on connections that execute ad-hoc queries directly.
//!
//! # Usage
//!
//! ```bash
//! cargo test -p dbsql-driver-tests
//!
//! # With pool and driver logging
//! RUST_LOG=dbsql=trace cargo test -p dbsql-driver-tests stmt_tests
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod fixtures;

#[cfg(test)]
pub mod exec_tests;

#[cfg(test)]
pub mod null_tests;

#[cfg(test)]
pub mod pool_tests;

#[cfg(test)]
pub mod query_tests;

#[cfg(test)]
pub mod stmt_tests;

#[cfg(test)]
pub mod tx_tests;
