//! Transaction Tests
//!
//! Transactions pin one connection until commit or rollback. These tests
//! cover statements bound to a transaction, queries inside one, the
//! terminal state after commit, and retrying `begin` on a bad connection.

use std::time::Duration;

use anyhow::{Context, Result};
use dbsql::SqlError;
use pretty_assertions::assert_eq;
use rstest::rstest;

use crate::fixtures::{TestMode, TestDb, new_test_db, people_db, wait_condition};

async fn t1_db(mode: TestMode, name: &str) -> Result<TestDb> {
    let t = new_test_db(mode, name).await?;
    t.db.exec("CREATE|t1|name=string,age=int32,dead=bool", &[])
        .await
        .context("Failed to create t1")?;
    Ok(t)
}

/// Test running a database statement inside a transaction
#[rstest]
#[case::prepared(TestMode::Prepared)]
#[case::direct(TestMode::Direct)]
#[tokio::test]
async fn test_tx_stmt(#[case] mode: TestMode) -> Result<()> {
    let t = t1_db(mode, "foo").await?;
    let stmt = t.db.prepare("INSERT|t1|name=?,age=?").await?;

    let tx = t.db.begin().await?;
    let txs = tx.stmt(&stmt).await;
    let result = txs.exec(&[&"Bobby", &7]).await?;
    assert_eq!(result.rows_affected(), 1);
    tx.commit().await.context("Failed to commit")?;

    // Committing closed the transaction's copy of the statement.
    assert!(matches!(txs.exec(&[&"Bobby", &7]).await, Err(SqlError::TxDone)));
    txs.close().await?;

    let mut age = 0i32;
    t.db.query_row("SELECT|t1|age|name=?", &[&"Bobby"])
        .await
        .scan(&mut [&mut age])
        .await?;
    assert_eq!(age, 7);

    stmt.close().await?;
    t.close().await
}

/// Test that a statement can't be moved into another database's
/// transaction
#[rstest]
#[case::prepared(TestMode::Prepared)]
#[case::direct(TestMode::Direct)]
#[tokio::test]
async fn test_tx_stmt_from_other_database(#[case] mode: TestMode) -> Result<()> {
    let t = t1_db(mode, "foo").await?;
    let other = t1_db(mode, "bar").await?;
    let stmt = other.db.prepare("INSERT|t1|name=?,age=?").await?;

    let tx = t.db.begin().await?;
    let txs = tx.stmt(&stmt).await;
    let err = txs
        .exec(&[&"Bobby", &7])
        .await
        .expect_err("statement from another database should fail");
    assert_eq!(
        err.to_string(),
        "Tx::stmt: statement from different database used"
    );
    tx.rollback().await?;

    stmt.close().await?;
    other.close().await?;
    t.close().await
}

/// Test a query on the transaction's connection
#[rstest]
#[case::prepared(TestMode::Prepared)]
#[case::direct(TestMode::Direct)]
#[tokio::test]
async fn test_tx_query(#[case] mode: TestMode) -> Result<()> {
    let t = t1_db(mode, "foo").await?;
    t.db.exec("INSERT|t1|name=Alice", &[]).await?;

    let tx = t.db.begin().await?;
    let mut rows = tx.query("SELECT|t1|name|", &[]).await?;
    assert!(rows.next().await, "expected one row: {:?}", rows.err());
    let mut name = String::new();
    rows.scan(&mut [&mut name])?;
    assert_eq!(name, "Alice");
    rows.close().await?;

    tx.rollback().await?;
    t.close().await
}

/// Test that a failed query leaves the transaction usable
#[rstest]
#[case::prepared(TestMode::Prepared)]
#[case::direct(TestMode::Direct)]
#[tokio::test]
async fn test_tx_query_invalid(#[case] mode: TestMode) -> Result<()> {
    let t = people_db(mode).await?;

    let tx = t.db.begin().await?;
    assert!(
        tx.query("SELECT|t1|name|", &[]).await.is_err(),
        "t1 doesn't exist"
    );
    assert!(!tx.is_done());

    let mut name = String::new();
    tx.query_row("SELECT|people|name|age=?", &[&1])
        .await
        .scan(&mut [&mut name])
        .await?;
    assert_eq!(name, "Alice");

    tx.rollback().await?;
    t.close().await
}

/// Test that `begin` retries when the driver reports a bad connection
#[rstest]
#[case::prepared(TestMode::Prepared)]
#[case::direct(TestMode::Direct)]
#[tokio::test]
async fn test_tx_bad_conn_retry(#[case] mode: TestMode) -> Result<()> {
    let t = t1_db(mode, "foo;badConn").await?;
    let stmt = t.db.prepare("INSERT|t1|name=?,age=?").await?;

    // The first begin fails with a bad connection and is retried on a new
    // one.
    let tx = t.db.begin().await.context("begin should survive a bad connection")?;
    let txs = tx.stmt(&stmt).await;
    txs.exec(&[&"Bobby", &7]).await?;
    tx.commit().await?;
    assert_eq!(t.driver.open_count(), 2);

    stmt.close().await?;
    t.close().await
}

/// Test two open cursors on the same transaction
#[rstest]
#[case::prepared(TestMode::Prepared)]
#[case::direct(TestMode::Direct)]
#[tokio::test]
async fn test_simultaneous_queries(#[case] mode: TestMode) -> Result<()> {
    let t = people_db(mode).await?;

    let tx = t.db.begin().await?;
    let mut r1 = tx.query("SELECT|people|name|", &[]).await?;
    let mut r2 = tx.query("SELECT|people|name|", &[]).await?;

    let mut names = Vec::new();
    while r1.next().await && r2.next().await {
        let (mut a, mut b) = (String::new(), String::new());
        r1.scan(&mut [&mut a])?;
        r2.scan(&mut [&mut b])?;
        assert_eq!(a, b);
        names.push(a);
    }
    assert_eq!(names, ["Alice", "Bob", "Chris"]);

    r1.close().await?;
    r2.close().await?;
    tx.rollback().await?;
    assert_eq!(t.driver.open_count(), 1, "both cursors share one connection");

    t.close().await
}

/// Test that commit and rollback are terminal
#[rstest]
#[case::prepared(TestMode::Prepared)]
#[case::direct(TestMode::Direct)]
#[tokio::test]
async fn test_tx_done(#[case] mode: TestMode) -> Result<()> {
    let t = people_db(mode).await?;

    let tx = t.db.begin().await?;
    tx.exec("INSERT|people|name=Dave,age=?", &[&4]).await?;
    tx.commit().await?;
    assert!(tx.is_done());
    assert_eq!(t.idle(), 1, "commit should return the connection");

    assert!(matches!(tx.commit().await, Err(SqlError::TxDone)));
    assert!(matches!(tx.rollback().await, Err(SqlError::TxDone)));
    let err = tx
        .exec("INSERT|people|name=Eve,age=?", &[&5])
        .await
        .expect_err("exec after commit should fail");
    assert_eq!(
        err.to_string(),
        "Transaction has already been committed or rolled back"
    );
    assert!(tx.prepare("SELECT|people|name|").await.is_err());

    t.close().await
}

/// Test that dropping an unfinished transaction rolls it back and frees
/// its connection
#[rstest]
#[case::prepared(TestMode::Prepared)]
#[case::direct(TestMode::Direct)]
#[tokio::test]
async fn test_tx_drop_rolls_back(#[case] mode: TestMode) -> Result<()> {
    let t = people_db(mode).await?;

    {
        let tx = t.db.begin().await?;
        tx.exec("INSERT|people|name=Dave,age=?", &[&4]).await?;
        assert_eq!(t.idle(), 0);
    }

    assert!(
        wait_condition(Duration::from_secs(1), || t.idle() == 1).await,
        "dropped transaction never released its connection"
    );
    // The connection can begin again, so the fake transaction ended.
    let tx = t.db.begin().await?;
    tx.rollback().await?;

    t.close().await
}
