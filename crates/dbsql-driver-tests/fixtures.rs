//! Test fixtures for the dbsql behaviour suite.
//!
//! Every test gets its own [`FakeDriver`], so counters start at zero and
//! tables never leak between tests. [`TestMode`] selects which execution
//! path the fake connections advertise, letting one test body cover both.
//!
//! # Usage
//!
//! ```rust,ignore
//! use dbsql_driver_tests::fixtures::{TestMode, people_db};
//! use rstest::rstest;
//!
//! #[rstest]
//! #[case::prepared(TestMode::Prepared)]
//! #[case::direct(TestMode::Direct)]
//! #[tokio::test]
//! async fn test_people(#[case] mode: TestMode) -> anyhow::Result<()> {
//!     let t = people_db(mode).await?;
//!     let mut name = String::new();
//!     t.db.query_row("SELECT|people|name|age=?", &[&1]).await.scan(&mut [&mut name]).await?;
//!     t.close().await
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use chrono::{DateTime, Utc};
use dbsql::{Database, DbConfig, DriverRegistry};
use dbsql_fakedb::{DRIVER_NAME, FakeDriver};
use once_cell::sync::Lazy;

/// Birth date stored for Chris in the `people` table
pub static CHRIS_BIRTHDAY: Lazy<DateTime<Utc>> =
    Lazy::new(|| DateTime::from_timestamp(123_456_789, 0).expect("valid timestamp"));

/// Which execution path the fake connections advertise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestMode {
    /// Every ad-hoc statement is prepared, run and closed
    Prepared,
    /// Ad-hoc statements run directly on the connection
    Direct,
}

impl TestMode {
    /// Data source name for database `name` in this mode
    pub fn dsn(&self, name: &str) -> String {
        match self {
            TestMode::Prepared => name.to_string(),
            TestMode::Direct => format!("{name};direct"),
        }
    }

    /// Prepares one ad-hoc query costs on the driver
    pub fn adhoc_prepares(&self) -> usize {
        match self {
            TestMode::Prepared => 1,
            TestMode::Direct => 0,
        }
    }
}

/// A database handle together with the driver instance behind it
pub struct TestDb {
    /// The handle under test
    pub db: Database,
    /// The fake driver, for inspecting its counters
    pub driver: Arc<FakeDriver>,
    /// Execution path in use
    pub mode: TestMode,
}

impl TestDb {
    /// Close the database and check that no connection failed to close.
    ///
    /// A fake connection refuses to close while it still has statements or
    /// a transaction open, so this catches handles the pool leaked.
    pub async fn close(self) -> Result<()> {
        self.db.close().await.context("Failed to close database")?;
        let errors = self.driver.close_errors();
        ensure!(errors.is_empty(), "connection closes failed: {errors:?}");
        ensure!(
            self.db.stats().idle() == 0,
            "idle connections left after close: {:?}",
            self.db.stats()
        );
        Ok(())
    }

    /// Number of connections sitting in the idle list
    pub fn idle(&self) -> usize {
        self.db.stats().idle()
    }

    /// Number of owners in the dependency graph
    pub fn dependencies(&self) -> usize {
        self.db.stats().dependencies()
    }
}

/// Open an empty, freshly wiped database with the default configuration
pub async fn new_test_db(mode: TestMode, name: &str) -> Result<TestDb> {
    new_test_db_with_config(mode, name, DbConfig::default()).await
}

/// Open an empty, freshly wiped database.
///
/// `name` may carry extra data source options, e.g. `"foo;badConn"`.
pub async fn new_test_db_with_config(mode: TestMode, name: &str, config: DbConfig) -> Result<TestDb> {
    initialize_logging();

    let driver = Arc::new(FakeDriver::new());
    let mut registry = DriverRegistry::new();
    registry.register(driver.clone());

    let db = Database::open_with_config(&registry, DRIVER_NAME, &mode.dsn(name), config)
        .context("Failed to open test database")?;
    db.exec("WIPE", &[]).await.context("Failed to wipe test database")?;

    Ok(TestDb { db, driver, mode })
}

/// A database with Alice (1), Bob (2) and Chris (3) in `people`
pub async fn people_db(mode: TestMode) -> Result<TestDb> {
    let t = new_test_db(mode, "people").await?;
    setup_people(&t.db).await?;
    Ok(t)
}

/// Create and fill the `people` table
pub async fn setup_people(db: &Database) -> Result<()> {
    db.exec(
        "CREATE|people|name=string,age=int32,photo=blob,dead=bool,bdate=datetime",
        &[],
    )
    .await
    .context("Failed to create people")?;
    db.exec("INSERT|people|name=Alice,age=?,photo=APHOTO", &[&1])
        .await
        .context("Failed to insert Alice")?;
    db.exec("INSERT|people|name=Bob,age=?,photo=BPHOTO", &[&2])
        .await
        .context("Failed to insert Bob")?;
    db.exec(
        "INSERT|people|name=Chris,age=?,photo=CPHOTO,bdate=?",
        &[&3, &*CHRIS_BIRTHDAY],
    )
    .await
    .context("Failed to insert Chris")?;
    Ok(())
}

/// A database whose `magicquery` table makes `op=sleep` queries sleep
pub async fn magicquery_db(mode: TestMode) -> Result<TestDb> {
    let t = new_test_db(mode, "magicquery").await?;
    t.db.exec("CREATE|magicquery|op=string,millis=int32", &[])
        .await
        .context("Failed to create magicquery")?;
    t.db.exec("INSERT|magicquery|op=sleep,millis=10", &[])
        .await
        .context("Failed to insert into magicquery")?;
    Ok(t)
}

/// Poll `condition` every 5ms until it holds or `timeout` elapses.
pub async fn wait_condition(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Initialize logging for tests (only once)
fn initialize_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("dbsql=info".parse().unwrap())
                    .add_directive("dbsql_driver_tests=debug".parse().unwrap()),
            )
            .with_test_writer()
            .finish();

        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}
