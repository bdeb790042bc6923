//! Driver registry for managing available database drivers

use std::collections::HashMap;
use std::sync::Arc;

use dbsql_core::DatabaseDriver;

/// Registry of available database drivers.
///
/// Owned by whoever opens databases; there is no process-wide default.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn DatabaseDriver>>,
}

impl DriverRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            drivers: HashMap::new(),
        }
    }

    /// Register a driver under its name, replacing any previous one
    pub fn register(&mut self, driver: Arc<dyn DatabaseDriver>) {
        let name = driver.name().to_string();
        tracing::info!(driver = %name, version = driver.version(), "registering database driver");
        if self.drivers.insert(name.clone(), driver).is_some() {
            tracing::warn!(driver = %name, "replaced previously registered driver");
        }
    }

    /// Get a driver by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn DatabaseDriver>> {
        let driver = self.drivers.get(name).cloned();
        if driver.is_none() {
            tracing::warn!(driver = %name, "driver not found in registry");
        }
        driver
    }

    /// List all registered driver names, sorted
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.drivers.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Check if a driver is registered
    pub fn has(&self, name: &str) -> bool {
        self.drivers.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dbsql_core::{DriverConnection, Result, SqlError};

    struct NamedDriver(&'static str);

    #[async_trait]
    impl DatabaseDriver for NamedDriver {
        fn name(&self) -> &'static str {
            self.0
        }

        async fn open(&self, _dsn: &str) -> Result<Box<dyn DriverConnection>> {
            Err(SqlError::NotSupported("test driver".into()))
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = DriverRegistry::new();
        registry.register(Arc::new(NamedDriver("beta")));
        registry.register(Arc::new(NamedDriver("alpha")));

        assert!(registry.has("alpha"));
        assert!(!registry.has("gamma"));
        assert!(registry.get("beta").is_some());
        assert!(registry.get("gamma").is_none());
        assert_eq!(registry.list(), vec!["alpha", "beta"]);
    }
}
