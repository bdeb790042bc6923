//! Database handle configuration

use serde::{Deserialize, Serialize};

use dbsql_core::{Result, SqlError};

const DEFAULT_MAX_IDLE_CONNS: usize = 2;
const DEFAULT_BAD_CONN_RETRIES: usize = 1;

/// Configuration for a [`Database`](crate::Database)
///
/// Controls how many idle connections are retained and how often an
/// operation is retried after the driver reports a bad connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    /// Maximum number of free connections kept for reuse. 0 disables
    /// idle retention.
    max_idle_conns: usize,
    /// How many times an operation is retried on a fresh connection after
    /// a bad-connection error
    bad_conn_retries: usize,
}

impl DbConfig {
    /// Create a configuration with the default settings
    pub fn new() -> Self {
        Self {
            max_idle_conns: DEFAULT_MAX_IDLE_CONNS,
            bad_conn_retries: DEFAULT_BAD_CONN_RETRIES,
        }
    }

    /// Load a configuration from TOML. Missing keys keep their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        toml::from_str(source).map_err(|e| SqlError::Configuration(e.to_string()))
    }

    /// Set the idle connection cap
    pub fn with_max_idle_conns(mut self, n: usize) -> Self {
        self.max_idle_conns = n;
        self
    }

    /// Set the bad-connection retry count
    pub fn with_bad_conn_retries(mut self, n: usize) -> Self {
        self.bad_conn_retries = n;
        self
    }

    /// Get the idle connection cap
    pub fn max_idle_conns(&self) -> usize {
        self.max_idle_conns
    }

    /// Get the bad-connection retry count
    pub fn bad_conn_retries(&self) -> usize {
        self.bad_conn_retries
    }
}

impl Default for DbConfig {
    /// Defaults:
    /// - max_idle_conns: 2
    /// - bad_conn_retries: 1
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = DbConfig::default();
        assert_eq!(config.max_idle_conns(), 2);
        assert_eq!(config.bad_conn_retries(), 1);
    }

    #[test]
    fn test_builders() {
        let config = DbConfig::new()
            .with_max_idle_conns(0)
            .with_bad_conn_retries(3);
        assert_eq!(config.max_idle_conns(), 0);
        assert_eq!(config.bad_conn_retries(), 3);
    }

    #[test]
    fn test_from_toml_keeps_missing_defaults() {
        let config = DbConfig::from_toml_str(indoc! {r#"
            max_idle_conns = 8
        "#})
        .unwrap();
        assert_eq!(config, DbConfig::new().with_max_idle_conns(8));
    }

    #[test]
    fn test_from_toml_rejects_bad_types() {
        let err = DbConfig::from_toml_str("max_idle_conns = \"many\"").unwrap_err();
        assert!(matches!(err, SqlError::Configuration(_)));
    }

    #[test]
    fn test_json_round_trip() {
        let config = DbConfig::new().with_bad_conn_retries(2);
        let json = serde_json::to_string(&config).unwrap();
        let back: DbConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
