//! Pool statistics types

use serde::{Deserialize, Serialize};

/// Snapshot of a pool's bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PoolStats {
    /// Connections opened and not yet fully closed
    open: usize,
    /// Free connections retained for reuse
    idle: usize,
    /// Connections checked out by a borrower
    in_use: usize,
    /// Resources still waiting on dependents before they can close
    dependencies: usize,
}

impl PoolStats {
    /// Create new pool statistics
    pub fn new(open: usize, idle: usize, in_use: usize, dependencies: usize) -> Self {
        Self {
            open,
            idle,
            in_use,
            dependencies,
        }
    }

    /// Get the number of open connections
    pub fn open(&self) -> usize {
        self.open
    }

    /// Get the number of idle connections
    pub fn idle(&self) -> usize {
        self.idle
    }

    /// Get the number of connections in use
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Get the number of entries in the dependency graph
    pub fn dependencies(&self) -> usize {
        self.dependencies
    }
}
