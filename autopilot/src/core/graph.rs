//! Dependency graph over feature ids.
//!
//! Nodes are feature ids; an edge `a -> b` means "`a` depends on `b`". Edges to
//! ids that are not nodes are ignored here; validation prunes and reports them
//! before the graph is built.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::core::error::SchedulerError;
use crate::core::feature::Feature;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    edges: BTreeMap<String, Vec<String>>,
}

impl DependencyGraph {
    pub fn from_features(features: &[Feature]) -> Self {
        let known: HashSet<&str> = features.iter().map(|f| f.id.as_str()).collect();
        let edges = features
            .iter()
            .map(|feature| {
                let deps = feature
                    .depends_on
                    .iter()
                    .filter(|dep| known.contains(dep.as_str()))
                    .cloned()
                    .collect();
                (feature.id.clone(), deps)
            })
            .collect();
        Self { edges }
    }

    pub fn node_count(&self) -> usize {
        self.edges.len()
    }

    pub fn dependencies(&self, id: &str) -> &[String] {
        self.edges.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Depth-first search with a recursion-stack marker.
    ///
    /// Returns the first cycle found as the path from the cycle's first node to
    /// the repeated node (e.g. `[x, y, z, x]`), or `None` if the graph is acyclic.
    pub fn detect_cycle(&self) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        let mut on_stack = HashSet::new();
        let mut path = Vec::new();
        for node in self.edges.keys() {
            if visited.contains(node.as_str()) {
                continue;
            }
            if let Some(cycle) = self.visit(node, &mut visited, &mut on_stack, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    fn visit<'a>(
        &'a self,
        node: &'a str,
        visited: &mut HashSet<&'a str>,
        on_stack: &mut HashSet<&'a str>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        visited.insert(node);
        on_stack.insert(node);
        path.push(node);

        for dep in self.dependencies(node) {
            let dep = dep.as_str();
            if on_stack.contains(dep) {
                let start = path.iter().position(|entry| *entry == dep).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(dep.to_string());
                return Some(cycle);
            }
            if !visited.contains(dep) {
                if let Some(cycle) = self.visit(dep, visited, on_stack, path) {
                    return Some(cycle);
                }
            }
        }

        path.pop();
        on_stack.remove(node);
        None
    }

    /// Kahn's algorithm; dependencies precede dependents.
    ///
    /// Among nodes that become available at the same time the smallest id is
    /// emitted first, so the order is independent of input order.
    pub fn topological_order(&self) -> Result<Vec<String>, SchedulerError> {
        let mut remaining: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (node, deps) in &self.edges {
            remaining.insert(node.as_str(), deps.len());
            for dep in deps {
                dependents.entry(dep.as_str()).or_default().push(node.as_str());
            }
        }

        let mut ready: BTreeSet<&str> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(node, _)| *node)
            .collect();
        let mut order = Vec::with_capacity(self.edges.len());

        while let Some(node) = ready.pop_first() {
            order.push(node.to_string());
            for dependent in dependents.get(node).into_iter().flatten() {
                if let Some(count) = remaining.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(*dependent);
                    }
                }
            }
        }

        if order.len() < self.edges.len() {
            let cycle = self.detect_cycle().unwrap_or_else(|| {
                let emitted: HashSet<&str> = order.iter().map(String::as_str).collect();
                remaining
                    .keys()
                    .filter(|node| !emitted.contains(*node))
                    .map(|node| node.to_string())
                    .collect()
            });
            return Err(SchedulerError::Cycle { cycle });
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::feature;

    #[test]
    fn topological_order_puts_dependencies_first() {
        let features = vec![
            feature("03", &["01", "02"]),
            feature("02", &["01"]),
            feature("01", &[]),
        ];
        let order = DependencyGraph::from_features(&features)
            .topological_order()
            .expect("acyclic");
        assert_eq!(order, vec!["01", "02", "03"]);
    }

    #[test]
    fn topological_order_breaks_ties_by_ascending_id() {
        let forward = vec![feature("b", &[]), feature("c", &[]), feature("a", &[])];
        let mut reversed = forward.clone();
        reversed.reverse();

        let first = DependencyGraph::from_features(&forward)
            .topological_order()
            .expect("acyclic");
        let second = DependencyGraph::from_features(&reversed)
            .topological_order()
            .expect("acyclic");
        assert_eq!(first, vec!["a", "b", "c"]);
        assert_eq!(first, second);
    }

    #[test]
    fn every_dependency_precedes_its_dependent() {
        let features = vec![
            feature("05", &["02", "04"]),
            feature("04", &["01"]),
            feature("03", &[]),
            feature("02", &["03", "01"]),
            feature("01", &[]),
        ];
        let order = DependencyGraph::from_features(&features)
            .topological_order()
            .expect("acyclic");
        let position = |id: &str| order.iter().position(|entry| entry == id).expect("present");
        for f in &features {
            for dep in &f.depends_on {
                assert!(position(dep) < position(&f.id), "{dep} must precede {}", f.id);
            }
        }
    }

    #[test]
    fn detects_three_node_cycle() {
        let features = vec![
            feature("x", &["y"]),
            feature("y", &["z"]),
            feature("z", &["x"]),
        ];
        let cycle = DependencyGraph::from_features(&features)
            .detect_cycle()
            .expect("cycle");
        assert_eq!(cycle, vec!["x", "y", "z", "x"]);
    }

    #[test]
    fn cycle_slice_starts_at_first_repeated_node() {
        let features = vec![
            feature("a", &["b"]),
            feature("b", &["c"]),
            feature("c", &["b"]),
        ];
        let cycle = DependencyGraph::from_features(&features)
            .detect_cycle()
            .expect("cycle");
        assert_eq!(cycle, vec!["b", "c", "b"]);
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let features = vec![feature("a", &["a"])];
        let cycle = DependencyGraph::from_features(&features).detect_cycle();
        assert_eq!(cycle, Some(vec!["a".to_string(), "a".to_string()]));
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let features = vec![
            feature("a", &[]),
            feature("b", &["a"]),
            feature("c", &["a"]),
            feature("d", &["b", "c"]),
        ];
        assert_eq!(DependencyGraph::from_features(&features).detect_cycle(), None);
    }

    #[test]
    fn topological_order_reports_cycle() {
        let features = vec![feature("a", &["b"]), feature("b", &["a"]), feature("c", &[])];
        let err = DependencyGraph::from_features(&features)
            .topological_order()
            .expect_err("cycle");
        assert_eq!(
            err,
            SchedulerError::Cycle {
                cycle: vec!["a".to_string(), "b".to_string(), "a".to_string()]
            }
        );
    }
}
