//! Deferred close bookkeeping
//!
//! Connections and statements may be asked to close while something still
//! uses them. Each such resource is an owner in a [`DependencyGraph`] that
//! waits on a set of dependency ids; it holds an edge to itself until its
//! close is requested. When the last edge goes away the graph hands the
//! owner back so the caller can run its final close outside the pool lock.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dbsql_core::Result;

use crate::invariant::invariant_violation;

/// Identity of anything that can take part in the dependency graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct DepId(u64);

impl DepId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        DepId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for DepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A resource whose teardown waits for its dependents.
#[async_trait]
pub(crate) trait FinalCloser: Send + Sync {
    fn dep_id(&self) -> DepId;

    /// Short label used in dependency dumps
    fn kind(&self) -> &'static str;

    /// Runs exactly once, after the last edge is removed.
    async fn final_close(&self) -> Result<()>;
}

struct DepNode {
    closer: Arc<dyn FinalCloser>,
    waiting_on: HashSet<DepId>,
}

#[derive(Default)]
pub(crate) struct DependencyGraph {
    nodes: HashMap<DepId, DepNode>,
}

impl DependencyGraph {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record that `owner` can't finish closing until `dep` is removed.
    pub(crate) fn add(&mut self, owner: Arc<dyn FinalCloser>, dep: DepId) {
        let id = owner.dep_id();
        self.nodes
            .entry(id)
            .or_insert_with(|| DepNode {
                closer: owner,
                waiting_on: HashSet::new(),
            })
            .waiting_on
            .insert(dep);
    }

    /// Register the self edge that stands for "close not requested yet".
    pub(crate) fn add_self(&mut self, owner: Arc<dyn FinalCloser>) {
        let id = owner.dep_id();
        self.add(owner, id);
    }

    /// Remove one edge. Returns the owner if that was its last edge; the
    /// caller must run `final_close` on it once the pool lock is released.
    pub(crate) fn remove(
        &mut self,
        owner: DepId,
        dep: DepId,
    ) -> Result<Option<Arc<dyn FinalCloser>>> {
        let Some(node) = self.nodes.get_mut(&owner) else {
            return Err(invariant_violation(format!(
                "unpaired dependency removal: no dependencies for {owner}"
            )));
        };
        if !node.waiting_on.remove(&dep) {
            return Err(invariant_violation(format!(
                "unpaired dependency removal: {} {owner} doesn't wait on {dep}",
                node.closer.kind()
            )));
        }
        if node.waiting_on.is_empty() {
            Ok(self.nodes.remove(&owner).map(|node| node.closer))
        } else {
            Ok(None)
        }
    }

    /// Drop the self edge of `owner`.
    pub(crate) fn request_close(&mut self, owner: DepId) -> Result<Option<Arc<dyn FinalCloser>>> {
        self.remove(owner, owner)
    }

    /// Number of owners that haven't finished closing
    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Human readable edges, sorted for stable output
    pub(crate) fn dump(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .nodes
            .iter()
            .flat_map(|(id, node)| {
                node.waiting_on.iter().map(move |dep| {
                    if dep == id {
                        format!("{} {id} waiting for close request", node.closer.kind())
                    } else {
                        format!("{} {id} waiting for -> {dep}", node.closer.kind())
                    }
                })
            })
            .collect();
        lines.sort();
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;

    struct CountingCloser {
        id: DepId,
        closes: AtomicUsize,
    }

    impl CountingCloser {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                id: DepId::next(),
                closes: AtomicUsize::new(0),
            })
        }

        fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl FinalCloser for CountingCloser {
        fn dep_id(&self) -> DepId {
            self.id
        }

        fn kind(&self) -> &'static str {
            "counter"
        }

        async fn final_close(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_close_waits_for_dependents() {
        let owner = CountingCloser::new();
        let rows_a = DepId::next();
        let rows_b = DepId::next();

        let mut graph = DependencyGraph::new();
        graph.add_self(owner.clone());
        graph.add(owner.clone(), rows_a);
        graph.add(owner.clone(), rows_b);
        assert_eq!(graph.len(), 1);

        assert!(graph.request_close(owner.id).unwrap().is_none());
        assert!(graph.remove(owner.id, rows_a).unwrap().is_none());
        let closer = graph.remove(owner.id, rows_b).unwrap().expect("last edge");
        closer.final_close().await.unwrap();

        assert_eq!(owner.closes(), 1);
        assert_eq!(graph.len(), 0);
    }

    #[tokio::test]
    async fn test_close_without_dependents_is_immediate() {
        let owner = CountingCloser::new();
        let mut graph = DependencyGraph::new();
        graph.add_self(owner.clone());

        let closer = graph.request_close(owner.id).unwrap().expect("no dependents");
        closer.final_close().await.unwrap();
        assert_eq!(owner.closes(), 1);
    }

    #[test]
    fn test_dump_lists_edges() {
        let owner = CountingCloser::new();
        let rows = DepId::next();
        let mut graph = DependencyGraph::new();
        graph.add_self(owner.clone());
        graph.add(owner.clone(), rows);

        let dump = graph.dump();
        assert_eq!(dump.len(), 2);
        assert!(dump.iter().any(|l| l.ends_with(&format!("-> {rows}"))));
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "unpaired dependency removal")]
    fn test_unpaired_remove_panics_in_debug() {
        let mut graph = DependencyGraph::new();
        let _ = graph.remove(DepId::next(), DepId::next());
    }
}
