//! Dependency graph.
//!
//! Orders steps by their `depend` edges and derived patterns by their
//! cross-pattern references. Topological order is deterministic (ties break
//! alphabetically) so workpackage ids are stable across runs.

use fxhash::{FxHashMap, FxHashSet};
use thiserror::Error;

/// Errors from graph operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GraphError {
    /// The dependency relation contains a cycle.
    #[error("dependency cycle through '{0}'")]
    Cycle(String),

    /// An edge references a node that was never added.
    #[error("unknown node '{0}'")]
    UnknownNode(String),
}

/// Directed dependency graph over string-named nodes.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// node → set of nodes it depends on
    requires: FxHashMap<String, FxHashSet<String>>,
    nodes: FxHashSet<String>,
}

impl DependencyGraph {
    /// New empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an isolated node.
    pub fn add_node(&mut self, id: impl Into<String>) {
        self.nodes.insert(id.into());
    }

    /// Record that `node` depends on `on`.
    pub fn add_dependency(&mut self, node: impl Into<String>, on: impl Into<String>) {
        let node = node.into();
        let on = on.into();
        self.nodes.insert(node.clone());
        self.nodes.insert(on.clone());
        self.requires.entry(node).or_default().insert(on);
    }

    /// Names this node directly depends on.
    pub fn dependencies(&self, id: &str) -> impl Iterator<Item = &str> {
        self.requires
            .get(id)
            .into_iter()
            .flat_map(|deps| deps.iter().map(String::as_str))
    }

    /// Deterministic topological order: dependencies before dependents,
    /// alphabetical among ready nodes.
    pub fn topological_order(&self) -> Result<Vec<String>, GraphError> {
        for deps in self.requires.values() {
            for dep in deps {
                if !self.nodes.contains(dep) {
                    return Err(GraphError::UnknownNode(dep.clone()));
                }
            }
        }

        let mut remaining: Vec<&String> = self.nodes.iter().collect();
        remaining.sort();
        let mut placed: FxHashSet<String> = FxHashSet::default();
        let mut order = Vec::with_capacity(remaining.len());

        while !remaining.is_empty() {
            let ready_idx = remaining.iter().position(|node| {
                self.requires
                    .get(*node)
                    .map(|deps| deps.iter().all(|d| placed.contains(d)))
                    .unwrap_or(true)
            });
            match ready_idx {
                Some(idx) => {
                    let node = remaining.remove(idx);
                    placed.insert(node.clone());
                    order.push(node.clone());
                }
                None => {
                    // Every remaining node waits on another remaining node.
                    return Err(GraphError::Cycle(remaining[0].clone()));
                }
            }
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependencies_precede_dependents() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency("run", "compile");
        graph.add_dependency("verify", "run");
        graph.add_node("compile");

        let order = graph.topological_order().unwrap();
        let pos = |name: &str| order.iter().position(|n| n == name).unwrap();
        assert!(pos("compile") < pos("run"));
        assert!(pos("run") < pos("verify"));
    }

    #[test]
    fn order_is_deterministic() {
        let mut graph = DependencyGraph::new();
        for name in ["c", "a", "b"] {
            graph.add_node(name);
        }
        assert_eq!(graph.topological_order().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn cycles_are_detected() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency("a", "b");
        graph.add_dependency("b", "c");
        graph.add_dependency("c", "a");
        assert!(matches!(
            graph.topological_order(),
            Err(GraphError::Cycle(_))
        ));
    }

    #[test]
    fn diamond_resolves() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency("d", "b");
        graph.add_dependency("d", "c");
        graph.add_dependency("b", "a");
        graph.add_dependency("c", "a");
        let order = graph.topological_order().unwrap();
        assert_eq!(order.first().map(String::as_str), Some("a"));
        assert_eq!(order.last().map(String::as_str), Some("d"));
    }
}
