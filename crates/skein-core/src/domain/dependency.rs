//! Dependency graph for cycle checks over service dependencies.
//!
//! Design:
//! - Forward edges: node -> nodes it depends on (waits for)
//! - Reverse edges: node -> nodes that depend on it (waiting nodes)
//! - Invariant: edges and reverse_edges must be kept in sync
//!
//! The graph is generic over the node key so the hierarchy arena can check
//! nodes that have no persisted id yet.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

/// Dependency graph for tracking dependencies between nodes.
///
/// `BTreeMap`/`BTreeSet` keep traversal order deterministic, so the reported
/// cycle is stable across runs.
#[derive(Debug, Clone)]
pub struct DependencyGraph<K> {
    /// Forward edges: node -> nodes it depends on (waits for)
    edges: BTreeMap<K, BTreeSet<K>>,

    /// Reverse edges: node -> nodes that depend on it
    reverse_edges: BTreeMap<K, BTreeSet<K>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    /// On the current DFS path
    Gray,
    /// Fully explored
    Black,
}

impl<K: Copy + Ord> DependencyGraph<K> {
    pub fn new() -> Self {
        Self {
            edges: BTreeMap::new(),
            reverse_edges: BTreeMap::new(),
        }
    }

    /// Add a dependency: `node` depends on `depends_on`.
    ///
    /// Example: add_dependency(b, a) means "B waits for A"
    pub fn add_dependency(&mut self, node: K, depends_on: K) {
        self.edges.entry(node).or_default().insert(depends_on);
        self.reverse_edges
            .entry(depends_on)
            .or_default()
            .insert(node);
    }

    /// Remove a dependency: `node` no longer depends on `depends_on`.
    pub fn remove_dependency(&mut self, node: K, depends_on: K) {
        if let Entry::Occupied(mut e) = self.edges.entry(node) {
            e.get_mut().remove(&depends_on);
            if e.get().is_empty() {
                e.remove_entry();
            }
        }
        if let Entry::Occupied(mut e) = self.reverse_edges.entry(depends_on) {
            e.get_mut().remove(&node);
            if e.get().is_empty() {
                e.remove_entry();
            }
        }
    }

    /// Nodes waiting for `node`.
    pub fn get_waiting(&self, node: K) -> Vec<K> {
        self.reverse_edges
            .get(&node)
            .map(|waiting| waiting.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn has_dependencies(&self, node: K) -> bool {
        self.edges.get(&node).is_some_and(|deps| !deps.is_empty())
    }

    pub fn get_dependencies(&self, node: K) -> Vec<K> {
        self.edges
            .get(&node)
            .map(|deps| deps.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Detect a cycle in the dependency graph.
    ///
    /// Three-colour DFS. Returns the first cycle found as a closed path
    /// (`[a, b, a]`), or None if the graph is a DAG.
    pub fn detect_cycle(&self) -> Option<Vec<K>> {
        let mut colors: BTreeMap<K, Color> = BTreeMap::new();
        for &start in self.edges.keys() {
            if colors.contains_key(&start) {
                continue;
            }
            if let Some(cycle) = self.dfs_cycle(start, &mut colors) {
                return Some(cycle);
            }
        }
        None
    }

    fn dfs_cycle(&self, start: K, colors: &mut BTreeMap<K, Color>) -> Option<Vec<K>> {
        // Each frame: (node, its dependencies, next index to visit)
        let mut stack: Vec<(K, Vec<K>, usize)> = vec![(start, self.get_dependencies(start), 0)];
        let mut path = vec![start];
        colors.insert(start, Color::Gray);

        while let Some((node, deps, idx)) = stack.last_mut() {
            if *idx >= deps.len() {
                colors.insert(*node, Color::Black);
                stack.pop();
                path.pop();
                continue;
            }
            let dep = deps[*idx];
            *idx += 1;

            match colors.get(&dep) {
                Some(Color::Gray) => {
                    let pos = path.iter().position(|n| *n == dep).unwrap_or(0);
                    let mut cycle = path[pos..].to_vec();
                    cycle.push(dep);
                    return Some(cycle);
                }
                Some(Color::Black) => {}
                None => {
                    colors.insert(dep, Color::Gray);
                    path.push(dep);
                    stack.push((dep, self.get_dependencies(dep), 0));
                }
            }
        }
        None
    }
}

impl<K: Copy + Ord> Default for DependencyGraph<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_graph_is_empty() {
        let graph: DependencyGraph<u32> = DependencyGraph::new();
        assert!(!graph.has_dependencies(1));
        assert!(graph.detect_cycle().is_none());
    }

    #[test]
    fn add_dependency_creates_both_edges() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(2, 1); // 2 depends on 1

        assert!(graph.has_dependencies(2));
        assert!(!graph.has_dependencies(1));
        assert_eq!(graph.get_dependencies(2), vec![1]);
        assert_eq!(graph.get_waiting(1), vec![2]);
    }

    #[test]
    fn remove_dependency_removes_both_edges() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(2, 1);
        graph.remove_dependency(2, 1);

        assert!(!graph.has_dependencies(2));
        assert!(graph.get_waiting(1).is_empty());
    }

    #[test]
    fn detect_simple_cycle() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(1, 2);
        graph.add_dependency(2, 1);

        assert_eq!(graph.detect_cycle(), Some(vec![1, 2, 1]));
    }

    #[test]
    fn detect_self_dependency() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(1, 1);

        assert_eq!(graph.detect_cycle(), Some(vec![1, 1]));
    }

    #[test]
    fn detect_longer_cycle() {
        let mut graph = DependencyGraph::new();
        // 2 -> 1, 3 -> 2, 4 -> 3, 2 -> 4 (cycle: 2 -> 4 -> 3 -> 2)
        graph.add_dependency(2, 1);
        graph.add_dependency(3, 2);
        graph.add_dependency(4, 3);
        graph.add_dependency(2, 4);

        let cycle = graph.detect_cycle().unwrap();
        assert_eq!(cycle.first(), cycle.last());
        assert!(cycle.contains(&2) && cycle.contains(&3) && cycle.contains(&4));
        assert!(!cycle.contains(&1));
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(2, 1);
        graph.add_dependency(3, 2);
        graph.add_dependency(3, 1);

        assert!(graph.detect_cycle().is_none());
    }

    #[test]
    fn complex_dag_with_cross_edges() {
        let mut graph = DependencyGraph::new();
        //     1
        //    / \
        //   2   3
        //   |\ /|
        //   | X |
        //   |/ \|
        //   4   5
        graph.add_dependency(2, 1);
        graph.add_dependency(3, 1);
        graph.add_dependency(4, 2);
        graph.add_dependency(5, 2);
        graph.add_dependency(4, 3);
        graph.add_dependency(5, 3);

        assert!(graph.detect_cycle().is_none());
    }
}
