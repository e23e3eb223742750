//! Ordering graph over keys
//!
//! An edge `a -> b` means `a` must be handled before `b`.

use std::collections::{BTreeMap, BTreeSet};

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

/// Directed graph over keys; an edge `a -> b` means `a` goes first
#[derive(Debug, Default)]
pub struct Dag {
    graph: DiGraph<String, ()>,
    index: BTreeMap<String, NodeIndex>,
}

impl Dag {
    /// Empty graph
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `key` unless present and return its index
    pub fn add_node(&mut self, key: &str) -> NodeIndex {
        if let Some(idx) = self.index.get(key) {
            return *idx;
        }
        let idx = self.graph.add_node(key.to_string());
        self.index.insert(key.to_string(), idx);
        idx
    }

    /// Add an ordering edge; self loops are kept and reported as cycles
    pub fn add_edge(&mut self, from: &str, to: &str) {
        let a = self.add_node(from);
        let b = self.add_node(to);
        self.graph.update_edge(a, b, ());
    }

    /// Whether `key` is in the graph
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// Number of keys
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Number of edges
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Keys that must be handled before `key`
    #[must_use]
    pub fn predecessors(&self, key: &str) -> BTreeSet<String> {
        self.index
            .get(key)
            .map(|idx| {
                self.graph
                    .neighbors_directed(*idx, Direction::Incoming)
                    .filter(|n| n != idx)
                    .map(|n| self.graph[n].clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every strongly connected component that forms a cycle, each sorted
    #[must_use]
    pub fn cycles(&self) -> Vec<Vec<String>> {
        let mut out: Vec<Vec<String>> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| {
                scc.len() > 1 || scc.iter().any(|n| self.graph.find_edge(*n, *n).is_some())
            })
            .map(|scc| {
                let mut keys: Vec<String> = scc.iter().map(|n| self.graph[*n].clone()).collect();
                keys.sort();
                keys
            })
            .collect();
        out.sort();
        out
    }

    /// Topological order, ties broken lexicographically
    ///
    /// # Errors
    /// Returns the keys left on cycles when no full order exists.
    pub fn topological_order(&self) -> Result<Vec<String>, Vec<String>> {
        let (order, rest) = self.kahn();
        if rest.is_empty() {
            Ok(order)
        } else {
            Err(rest)
        }
    }

    /// Topological order where keys stuck on cycles are appended in key order
    #[must_use]
    pub fn lenient_order(&self) -> Vec<String> {
        let (mut order, rest) = self.kahn();
        order.extend(rest);
        order
    }

    /// Keys with no predecessors
    #[must_use]
    pub fn entry_nodes(&self) -> Vec<String> {
        self.index
            .iter()
            .filter(|(_, idx)| {
                self.graph
                    .neighbors_directed(**idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn kahn(&self) -> (Vec<String>, Vec<String>) {
        let mut in_degree: BTreeMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|n| (n, self.graph.neighbors_directed(n, Direction::Incoming).count()))
            .collect();
        let mut ready: BTreeSet<(String, NodeIndex)> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| (self.graph[*n].clone(), *n))
            .collect();
        let mut order = Vec::with_capacity(self.graph.node_count());

        while let Some(next) = ready.pop_first() {
            let (key, idx) = next;
            order.push(key);
            for succ in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                if let Some(d) = in_degree.get_mut(&succ) {
                    *d = d.saturating_sub(1);
                    if *d == 0 {
                        ready.insert((self.graph[succ].clone(), succ));
                    }
                }
            }
            in_degree.remove(&idx);
        }

        let mut rest: Vec<String> = in_degree.keys().map(|n| self.graph[*n].clone()).collect();
        rest.sort();
        (order, rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_dependencies_first() {
        let mut dag = Dag::new();
        dag.add_edge("b", "a");
        dag.add_edge("c", "b");
        dag.add_node("z");
        assert_eq!(dag.topological_order().unwrap(), vec!["c", "b", "a", "z"]);
    }

    #[test]
    fn ties_are_lexicographic() {
        let mut dag = Dag::new();
        for key in ["m", "b", "x", "a"] {
            dag.add_node(key);
        }
        assert_eq!(dag.topological_order().unwrap(), vec!["a", "b", "m", "x"]);
        assert_eq!(dag.entry_nodes(), vec!["a", "b", "m", "x"]);
    }

    #[test]
    fn detects_cycle() {
        let mut dag = Dag::new();
        dag.add_edge("a", "b");
        dag.add_edge("b", "c");
        dag.add_edge("c", "a");
        dag.add_edge("c", "d");
        assert_eq!(dag.cycles(), vec![vec!["a", "b", "c"]]);
        assert_eq!(dag.topological_order().unwrap_err(), vec!["a", "b", "c", "d"]);
        assert_eq!(dag.lenient_order(), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn self_loop_is_cycle() {
        let mut dag = Dag::new();
        dag.add_edge("a", "a");
        assert_eq!(dag.cycles(), vec![vec!["a"]]);
        assert!(dag.predecessors("a").is_empty());
    }

    #[test]
    fn duplicate_edges_collapse() {
        let mut dag = Dag::new();
        dag.add_edge("a", "b");
        dag.add_edge("a", "b");
        assert_eq!(dag.edge_count(), 1);
        assert_eq!(dag.node_count(), 2);
        assert_eq!(dag.predecessors("b"), ["a".to_string()].into());
    }
}
