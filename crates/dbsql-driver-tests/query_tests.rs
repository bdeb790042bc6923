//! Query Tests
//!
//! Ad-hoc queries on the database handle: cursors, single-row queries,
//! scanning into the supported destination types and the errors scanning
//! reports.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dbsql::{RawBytes, SqlError};
use pretty_assertions::assert_eq;
use rstest::rstest;

use crate::fixtures::{CHRIS_BIRTHDAY, TestMode, new_test_db, people_db, wait_condition};

/// Test that a query returns every row in insertion order and costs one
/// prepare only when the connection can't run it directly
#[rstest]
#[case::prepared(TestMode::Prepared)]
#[case::direct(TestMode::Direct)]
#[tokio::test]
async fn test_query(#[case] mode: TestMode) -> Result<()> {
    let t = people_db(mode).await?;
    let prepares0 = t.driver.num_prepares();

    let mut rows = t
        .db
        .query("SELECT|people|age,name|", &[])
        .await
        .context("Failed to query people")?;
    assert_eq!(
        t.driver.num_prepares() - prepares0,
        mode.adhoc_prepares(),
        "unexpected number of prepares"
    );

    let mut got = Vec::new();
    while rows.next().await {
        let mut age = 0i32;
        let mut name = String::new();
        rows.scan(&mut [&mut age, &mut name])?;
        got.push((age, name));
    }
    assert!(rows.err().is_none(), "unexpected error: {:?}", rows.err());
    assert_eq!(
        got,
        vec![
            (1, "Alice".to_string()),
            (2, "Bob".to_string()),
            (3, "Chris".to_string()),
        ]
    );

    // Reaching the end closed the cursor and returned its connection.
    assert!(rows.is_closed());
    assert_eq!(t.idle(), 1);

    t.close().await
}

/// Test that column names are known before the first row is read
#[rstest]
#[case::prepared(TestMode::Prepared)]
#[case::direct(TestMode::Direct)]
#[tokio::test]
async fn test_query_columns(#[case] mode: TestMode) -> Result<()> {
    let t = people_db(mode).await?;

    let mut rows = t.db.query("SELECT|people|age,name|", &[]).await?;
    assert_eq!(rows.columns()?, ["age".to_string(), "name".to_string()]);

    rows.close().await?;
    assert!(matches!(rows.columns(), Err(SqlError::RowsClosed)));
    rows.close().await.context("second close should be a no-op")?;

    t.close().await
}

/// Test single-row queries, including scanning with the wrong number of
/// destinations
#[rstest]
#[case::prepared(TestMode::Prepared)]
#[case::direct(TestMode::Direct)]
#[tokio::test]
async fn test_query_row(#[case] mode: TestMode) -> Result<()> {
    let t = people_db(mode).await?;

    let mut age = 0i32;
    let err = t
        .db
        .query_row("SELECT|people|age,name|age=?", &[&3])
        .await
        .scan(&mut [&mut age])
        .await
        .expect_err("scan with one destination for two columns should fail");
    assert_eq!(
        err.to_string(),
        "expected 2 destination arguments in scan, not 1"
    );

    let mut name = String::new();
    t.db.query_row("SELECT|people|age,name|age=?", &[&2])
        .await
        .scan(&mut [&mut age, &mut name])
        .await?;
    assert_eq!((age, name.as_str()), (2, "Bob"));

    let err = t
        .db
        .query_row("SELECT|people|name|age=?", &[&42])
        .await
        .scan(&mut [&mut name])
        .await
        .expect_err("no one is 42");
    assert!(matches!(err, SqlError::NoRows), "got {err}");

    t.close().await
}

/// Test that a single-row query closes its ad-hoc statement
#[rstest]
#[case::prepared(TestMode::Prepared)]
#[case::direct(TestMode::Direct)]
#[tokio::test]
async fn test_query_row_closes_statement(#[case] mode: TestMode) -> Result<()> {
    let t = people_db(mode).await?;

    let mut age = 0i32;
    let mut name = String::new();
    t.db.query_row("SELECT|people|age,name|age=?", &[&3])
        .await
        .scan(&mut [&mut age, &mut name])
        .await?;
    assert_eq!(name, "Chris");

    assert_eq!(t.idle(), 1, "the connection should be idle again");
    for stats in t.driver.connection_stats() {
        assert_eq!(
            stats.stmts_made, stats.stmts_closed,
            "statement leaked: {stats:?}"
        );
    }

    t.close().await
}

/// Test that timestamps survive a round trip
#[rstest]
#[case::prepared(TestMode::Prepared)]
#[case::direct(TestMode::Direct)]
#[tokio::test]
async fn test_time_values(#[case] mode: TestMode) -> Result<()> {
    let t = people_db(mode).await?;

    let mut bdate = DateTime::<Utc>::default();
    t.db.query_row("SELECT|people|bdate|age=?", &[&3])
        .await
        .scan(&mut [&mut bdate])
        .await?;
    assert_eq!(bdate, *CHRIS_BIRTHDAY);

    t.close().await
}

/// Test scanning blobs into owned buffers and into reused raw buffers
#[rstest]
#[case::prepared(TestMode::Prepared)]
#[case::direct(TestMode::Direct)]
#[tokio::test]
async fn test_byte_slices_and_raw_bytes(#[case] mode: TestMode) -> Result<()> {
    let t = people_db(mode).await?;

    let mut photo = Vec::<u8>::new();
    t.db.query_row("SELECT|people|photo|name=?", &[&"Alice"])
        .await
        .scan(&mut [&mut photo])
        .await?;
    assert_eq!(photo, b"APHOTO");

    let mut rows = t.db.query("SELECT|people|name,photo|", &[]).await?;
    let mut raw = RawBytes::new();
    let mut photos = Vec::new();
    while rows.next().await {
        let mut name = String::new();
        rows.scan(&mut [&mut name, &mut raw])?;
        photos.push(String::from_utf8_lossy(raw.as_bytes()).into_owned());
    }
    assert_eq!(photos, ["APHOTO", "BPHOTO", "CPHOTO"]);

    let err = t
        .db
        .query_row("SELECT|people|photo|name=?", &[&"Bob"])
        .await
        .scan(&mut [&mut raw])
        .await
        .expect_err("RawBytes can't outlive a single-row query");
    assert_eq!(err.to_string(), "RawBytes isn't allowed on Row::scan");

    t.close().await
}

/// Test that NULL scans into an empty byte buffer
#[rstest]
#[case::prepared(TestMode::Prepared)]
#[case::direct(TestMode::Direct)]
#[tokio::test]
async fn test_null_byte_slice(#[case] mode: TestMode) -> Result<()> {
    let t = new_test_db(mode, "foo").await?;
    t.db.exec("CREATE|t|id=int32,name=nullstring", &[]).await?;
    t.db.exec("INSERT|t|id=10,name=?", &[&None::<String>]).await?;

    let mut name = b"stale".to_vec();
    t.db.query_row("SELECT|t|name|id=?", &[&10])
        .await
        .scan(&mut [&mut name])
        .await?;
    assert!(name.is_empty(), "got {name:?}");

    t.db.exec("INSERT|t|id=11,name=?", &[&"bob"]).await?;
    t.db.query_row("SELECT|t|name|id=?", &[&11])
        .await
        .scan(&mut [&mut name])
        .await?;
    assert_eq!(name, b"bob");

    t.close().await
}

/// Test `Option` arguments and destinations
#[rstest]
#[case::prepared(TestMode::Prepared)]
#[case::direct(TestMode::Direct)]
#[tokio::test]
async fn test_optional_params_and_scans(#[case] mode: TestMode) -> Result<()> {
    let t = new_test_db(mode, "foo").await?;
    t.db.exec("CREATE|t|id=int32,name=nullstring", &[]).await?;
    t.db.exec("INSERT|t|id=1,name=?", &[&Some("bob".to_string())])
        .await?;
    t.db.exec("INSERT|t|id=2,name=?", &[&None::<String>]).await?;

    let mut name: Option<String> = None;
    t.db.query_row("SELECT|t|name|id=?", &[&1])
        .await
        .scan(&mut [&mut name])
        .await?;
    assert_eq!(name.as_deref(), Some("bob"));

    t.db.query_row("SELECT|t|name|id=?", &[&2])
        .await
        .scan(&mut [&mut name])
        .await?;
    assert_eq!(name, None);

    t.close().await
}

/// Test that an absent destination is reported with its column
#[rstest]
#[case::prepared(TestMode::Prepared)]
#[case::direct(TestMode::Direct)]
#[tokio::test]
async fn test_missing_scan_destination(#[case] mode: TestMode) -> Result<()> {
    let t = people_db(mode).await?;

    let mut missing: Option<&mut String> = None;
    let err = t
        .db
        .query_row("SELECT|people|name|age=?", &[&1])
        .await
        .scan(&mut [&mut missing])
        .await
        .expect_err("scan into a missing destination should fail");
    assert_eq!(
        err.to_string(),
        "scan error on column index 0: destination is None"
    );

    t.close().await
}

/// Test that a literal the column type can't hold fails the statement
#[rstest]
#[case::prepared(TestMode::Prepared)]
#[case::direct(TestMode::Direct)]
#[tokio::test]
async fn test_bogus_prebound_parameter(#[case] mode: TestMode) -> Result<()> {
    let t = new_test_db(mode, "foo").await?;
    t.db.exec("CREATE|t|name=string,age=int32,dead=bool", &[])
        .await?;

    let err = t
        .db
        .exec("INSERT|t|name=?,age=bogusconversion", &[&"bob"])
        .await
        .expect_err("bogus literal should be rejected");
    assert_eq!(
        err.to_string(),
        "fakedb: invalid conversion to int32 from \"bogusconversion\""
    );

    let err = t
        .db
        .prepare("INSERT|t|name=?,age=bogusconversion")
        .await
        .expect_err("bogus literal should be rejected at prepare");
    assert_eq!(
        err.to_string(),
        "fakedb: invalid conversion to int32 from \"bogusconversion\""
    );

    t.close().await
}

/// Test many tasks running single-row queries at once
#[rstest]
#[case::prepared(TestMode::Prepared)]
#[case::direct(TestMode::Direct)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_query_row(#[case] mode: TestMode) -> Result<()> {
    let t = people_db(mode).await?;

    let tasks = (0..30).map(|i| {
        let db = t.db.clone();
        let age = i % 3 + 1;
        tokio::spawn(async move {
            let mut name = String::new();
            db.query_row("SELECT|people|name|age=?", &[&age])
                .await
                .scan(&mut [&mut name])
                .await?;
            Ok::<_, SqlError>((age, name))
        })
    });
    for joined in futures::future::join_all(tasks).await {
        let (age, name) = joined.context("query task panicked")??;
        let want = ["Alice", "Bob", "Chris"][age as usize - 1];
        assert_eq!(name, want);
    }

    // Connections beyond the idle cap are closed on release.
    assert!(
        wait_condition(Duration::from_secs(1), || t.idle() <= 2).await,
        "idle = {}",
        t.idle()
    );
    let stats = t.db.stats();
    assert_eq!(stats.in_use(), 0, "{stats:?}");

    t.close().await
}

/// Test many tasks sharing one statement, each looking up its own row
#[rstest]
#[case::prepared(TestMode::Prepared)]
#[case::direct(TestMode::Direct)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_statement_query_row(#[case] mode: TestMode) -> Result<()> {
    let t = people_db(mode).await?;
    let stmt = t.db.prepare("SELECT|people|name,age|age=?").await?;

    let tasks = (0..30).map(|i| {
        let stmt = stmt.clone();
        let age: i32 = i % 3 + 1;
        tokio::spawn(async move {
            let mut name = String::new();
            let mut got_age = 0i32;
            stmt.query_row(&[&age])
                .await
                .scan(&mut [&mut name, &mut got_age])
                .await?;
            Ok::<_, SqlError>((age, name, got_age))
        })
    });
    for joined in futures::future::join_all(tasks).await {
        let (age, name, got_age) = joined.context("query task panicked")??;
        assert_eq!(got_age, age);
        assert_eq!(name, ["Alice", "Bob", "Chris"][age as usize - 1]);
    }

    assert!(
        wait_condition(Duration::from_secs(1), || t.db.stats().in_use() == 0).await,
        "connections still in use: {:?}",
        t.db.stats()
    );
    assert!(t.idle() <= 2);

    stmt.close().await?;
    t.close().await
}
