//! Dependency graph (DAG) construction and traversal
//!
//! Builds forward and reverse dependency graphs from `depends_on` edges.
//! Every collection is ordered, so traversal results and the topological
//! order are deterministic.

use crate::manifest::{Manifest, ManifestError};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Node identifier (unique_id from manifest)
pub type NodeId = String;

/// Dependency graph with forward and reverse edges
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    /// node -> nodes it depends on
    parents: BTreeMap<NodeId, BTreeSet<NodeId>>,

    /// node -> nodes that depend on it
    children: BTreeMap<NodeId, BTreeSet<NodeId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a dependency graph from a manifest
    ///
    /// Every node and source is present even without edges.
    pub fn from_manifest(manifest: &Manifest) -> Self {
        let mut graph = Self::new();

        for id in manifest.nodes.keys().chain(manifest.sources.keys()) {
            graph.add_node(id);
        }

        let edges = manifest
            .nodes
            .iter()
            .map(|(id, n)| (id, &n.depends_on))
            .chain(manifest.exposures.iter().map(|(id, e)| (id, &e.depends_on)))
            .chain(manifest.metrics.iter().map(|(id, m)| (id, &m.depends_on)))
            .chain(manifest.semantic_models.iter().map(|(id, m)| (id, &m.depends_on)))
            .chain(manifest.saved_queries.iter().map(|(id, q)| (id, &q.depends_on)))
            .chain(manifest.unit_tests.iter().map(|(id, t)| (id, &t.depends_on)));

        for (id, depends_on) in edges {
            graph.add_node(id);
            for parent in &depends_on.nodes {
                graph.add_edge(parent, id);
            }
        }

        graph
    }

    pub fn add_node(&mut self, id: &str) {
        self.parents.entry(id.to_string()).or_default();
        self.children.entry(id.to_string()).or_default();
    }

    /// `child` depends on `parent`
    pub fn add_edge(&mut self, parent: &str, child: &str) {
        self.add_node(parent);
        self.add_node(child);
        if let Some(set) = self.parents.get_mut(child) {
            set.insert(parent.to_string());
        }
        if let Some(set) = self.children.get_mut(parent) {
            set.insert(child.to_string());
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.parents.contains_key(id)
    }

    /// All node ids, sorted
    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.parents.keys()
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    /// Direct parents (dependencies) of a node
    pub fn parents(&self, node_id: &str) -> Vec<&NodeId> {
        self.parents
            .get(node_id)
            .map(|set| set.iter().collect())
            .unwrap_or_default()
    }

    /// Direct children (dependents) of a node
    pub fn children(&self, node_id: &str) -> Vec<&NodeId> {
        self.children
            .get(node_id)
            .map(|set| set.iter().collect())
            .unwrap_or_default()
    }

    /// node -> sorted children, every node present
    pub fn forward_edges(&self) -> BTreeMap<NodeId, Vec<NodeId>> {
        self.children
            .iter()
            .map(|(id, set)| (id.clone(), set.iter().cloned().collect()))
            .collect()
    }

    /// node -> sorted parents, every node present
    pub fn backward_edges(&self) -> BTreeMap<NodeId, Vec<NodeId>> {
        self.parents
            .iter()
            .map(|(id, set)| (id.clone(), set.iter().cloned().collect()))
            .collect()
    }

    /// Everything downstream of a node, optionally limited to `max_depth` hops
    pub fn descendants(&self, node_id: &str, max_depth: Option<usize>) -> BTreeSet<NodeId> {
        walk(&self.children, node_id, max_depth)
    }

    /// Everything upstream of a node, optionally limited to `max_depth` hops
    pub fn ancestors(&self, node_id: &str, max_depth: Option<usize>) -> BTreeSet<NodeId> {
        walk(&self.parents, node_id, max_depth)
    }

    /// Check if there's a path from source to target
    pub fn has_path(&self, source: &str, target: &str) -> bool {
        self.descendants(source, None).contains(target)
    }

    /// Topological sort using Kahn's algorithm
    ///
    /// Ready nodes are taken in lexicographic order. A cycle is reported with
    /// one of its loops.
    pub fn topological_sort(&self) -> Result<Vec<NodeId>, ManifestError> {
        let mut in_degree: BTreeMap<&str, usize> = self
            .parents
            .iter()
            .map(|(id, parents)| (id.as_str(), parents.len()))
            .collect();

        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut result = Vec::with_capacity(self.parents.len());

        while let Some(node_id) = ready.pop_first() {
            result.push(node_id.to_string());
            if let Some(children) = self.children.get(node_id) {
                for child in children {
                    if let Some(degree) = in_degree.get_mut(child.as_str()) {
                        *degree -= 1;
                        if *degree == 0 {
                            ready.insert(child.as_str());
                        }
                    }
                }
            }
        }

        if result.len() == self.parents.len() {
            Ok(result)
        } else {
            Err(ManifestError::Cycle {
                nodes: self.find_cycle().unwrap_or_default(),
            })
        }
    }

    /// One cycle, as a closed path `a -> b -> ... -> a`
    pub fn find_cycle(&self) -> Option<Vec<NodeId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit<'a>(
            graph: &'a DependencyGraph,
            node: &'a str,
            marks: &mut BTreeMap<&'a str, Mark>,
            stack: &mut Vec<&'a str>,
        ) -> Option<Vec<NodeId>> {
            marks.insert(node, Mark::Visiting);
            stack.push(node);
            if let Some(children) = graph.children.get(node) {
                for child in children {
                    match marks.get(child.as_str()) {
                        Some(Mark::Visiting) => {
                            let start = stack.iter().position(|n| *n == child.as_str()).unwrap_or(0);
                            let mut cycle: Vec<NodeId> = stack[start..].iter().map(|s| s.to_string()).collect();
                            cycle.push(child.clone());
                            return Some(cycle);
                        }
                        Some(Mark::Done) => {}
                        None => {
                            if let Some(cycle) = visit(graph, child, marks, stack) {
                                return Some(cycle);
                            }
                        }
                    }
                }
            }
            stack.pop();
            marks.insert(node, Mark::Done);
            None
        }

        let mut marks = BTreeMap::new();
        for node in self.parents.keys() {
            if !marks.contains_key(node.as_str()) {
                let mut stack = Vec::new();
                if let Some(cycle) = visit(self, node, &mut marks, &mut stack) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    /// Selected nodes, their descendants, and every ancestor of those
    /// descendants
    pub fn select_childrens_parents(&self, selected: &BTreeSet<NodeId>) -> BTreeSet<NodeId> {
        let mut with_children: BTreeSet<NodeId> = selected.clone();
        for id in selected {
            with_children.extend(self.descendants(id, None));
        }
        let mut result = with_children.clone();
        for id in &with_children {
            result.extend(self.ancestors(id, None));
        }
        result
    }

    /// Graph restricted to `selected`
    ///
    /// When a path between two selected nodes runs only through removed
    /// nodes, the two are joined by a direct edge.
    pub fn subgraph(&self, selected: &BTreeSet<NodeId>) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        for id in selected.iter().filter(|id| self.contains(id)) {
            graph.add_node(id);

            let mut seen = BTreeSet::new();
            let mut queue: VecDeque<&NodeId> = self.parents(id).into_iter().collect();
            while let Some(parent) = queue.pop_front() {
                if !seen.insert(parent.clone()) {
                    continue;
                }
                if selected.contains(parent) {
                    graph.add_edge(parent, id);
                } else {
                    queue.extend(self.parents(parent));
                }
            }
        }
        graph
    }
}

fn walk(edges: &BTreeMap<NodeId, BTreeSet<NodeId>>, start: &str, max_depth: Option<usize>) -> BTreeSet<NodeId> {
    let mut result = BTreeSet::new();
    let mut queue = VecDeque::new();
    queue.push_back((start, 0usize));

    while let Some((current, depth)) = queue.pop_front() {
        if max_depth.is_some_and(|max| depth >= max) {
            continue;
        }
        if let Some(next) = edges.get(current) {
            for id in next {
                if id != start && result.insert(id.clone()) {
                    queue.push_back((id.as_str(), depth + 1));
                }
            }
        }
    }

    result
}

/// macro id -> sorted ids of the macros and nodes that depend on it
pub fn macro_child_map(manifest: &Manifest) -> BTreeMap<NodeId, Vec<NodeId>> {
    let mut map: BTreeMap<NodeId, BTreeSet<NodeId>> = BTreeMap::new();
    for id in manifest.macros.keys() {
        map.entry(id.clone()).or_default();
    }
    let macro_deps = manifest.macros.iter().map(|(id, m)| (id, &m.depends_on.macros));
    let node_deps = manifest.nodes.iter().map(|(id, n)| (id, &n.depends_on.macros));
    for (id, deps) in macro_deps.chain(node_deps) {
        for dep in deps {
            map.entry(dep.clone()).or_default().insert(id.clone());
        }
    }
    map.into_iter()
        .map(|(id, set)| (id, set.into_iter().collect()))
        .collect()
}

/// group name -> sorted member ids
pub fn group_map(manifest: &Manifest) -> BTreeMap<String, Vec<NodeId>> {
    let mut map: BTreeMap<String, BTreeSet<NodeId>> = BTreeMap::new();
    for group in manifest.groups.values() {
        map.entry(group.name.clone()).or_default();
    }
    for (id, node) in &manifest.nodes {
        if let Some(group) = node.group() {
            map.entry(group.to_string()).or_default().insert(id.clone());
        }
    }
    for (id, metric) in &manifest.metrics {
        if let Some(group) = &metric.group {
            map.entry(group.clone()).or_default().insert(id.clone());
        }
    }
    map.into_iter()
        .map(|(name, set)| (name, set.into_iter().collect()))
        .collect()
}

impl Manifest {
    /// Rebuild parent, child, macro child and group maps from `depends_on`
    pub fn build_maps(&mut self) -> DependencyGraph {
        let graph = DependencyGraph::from_manifest(self);
        self.parent_map = graph.backward_edges();
        self.child_map = graph.forward_edges();
        self.macro_child_map = macro_child_map(self);
        self.group_map = group_map(self);
        graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Node, NodeConfig, ResourceType};
    use crate::resources::{Macro, SourceDefinition};
    use pretty_assertions::assert_eq;

    fn model(name: &str, deps: &[&str]) -> Node {
        let mut node = Node::new(ResourceType::Model, "p", name, format!("models/{}.sql", name));
        for dep in deps {
            node.depends_on.add_node(*dep);
        }
        node
    }

    fn graph(edges: &[(&str, &str)]) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        for (parent, child) in edges {
            graph.add_edge(parent, child);
        }
        graph
    }

    #[test]
    fn build_dag_from_manifest() {
        let mut manifest = Manifest::default();
        manifest
            .add_source(SourceDefinition::new("p", "raw", "orders", "models/src.yml"))
            .unwrap();
        manifest.add_node(model("a", &["source.p.raw.orders"])).unwrap();
        manifest.add_node(model("b", &["model.p.a"])).unwrap();
        manifest.add_node(model("lonely", &[])).unwrap();

        let graph = DependencyGraph::from_manifest(&manifest);
        assert_eq!(graph.len(), 4);
        assert_eq!(graph.parents("model.p.b"), vec!["model.p.a"]);
        assert_eq!(graph.children("source.p.raw.orders"), vec!["model.p.a"]);
        assert!(graph.forward_edges().contains_key("model.p.lonely"));
        assert!(graph.has_path("source.p.raw.orders", "model.p.b"));
        assert!(!graph.has_path("model.p.b", "model.p.a"));
    }

    #[test]
    fn topological_order_breaks_ties_lexicographically() {
        let g = graph(&[("c", "d"), ("a", "d"), ("b", "c")]);
        assert_eq!(g.topological_sort().unwrap(), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn cycles_are_reported() {
        let g = graph(&[("a", "b"), ("b", "c"), ("c", "a")]);
        let err = g.topological_sort().unwrap_err();
        match err {
            ManifestError::Cycle { nodes } => {
                assert_eq!(nodes.first(), nodes.last());
                assert_eq!(nodes.len(), 4);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn depth_limited_traversal() {
        let g = graph(&[("a", "b"), ("b", "c"), ("c", "d")]);
        let one: Vec<_> = g.descendants("a", Some(1)).into_iter().collect();
        assert_eq!(one, vec!["b"]);
        assert_eq!(g.descendants("a", None).len(), 3);
        let up: Vec<_> = g.ancestors("d", Some(2)).into_iter().collect();
        assert_eq!(up, vec!["b", "c"]);
    }

    #[test]
    fn childrens_parents_selection() {
        // x -> b, a -> b, b -> c
        let g = graph(&[("a", "b"), ("x", "b"), ("b", "c")]);
        let selected: BTreeSet<_> = ["a".to_string()].into();
        let all: Vec<_> = g.select_childrens_parents(&selected).into_iter().collect();
        assert_eq!(all, vec!["a", "b", "c", "x"]);
    }

    #[test]
    fn subgraph_keeps_transitive_edges() {
        let g = graph(&[("a", "b"), ("b", "c"), ("c", "d")]);
        let selected: BTreeSet<_> = ["a".to_string(), "d".to_string()].into();
        let sub = g.subgraph(&selected);
        assert_eq!(sub.parents("d"), vec!["a"]);
        assert_eq!(sub.len(), 2);
    }

    #[test]
    fn maps_are_built_sorted() {
        let mut manifest = Manifest::default();
        let mut mac = Macro::new("p", "helper", "macros/h.sql", "{% macro helper() %}{% endmacro %}");
        mac.depends_on.macros.push("macro.p.other".to_string());
        manifest.add_macro(mac).unwrap();

        let mut a = model("a", &[]).with_config(NodeConfig {
            group: Some("finance".to_string()),
            ..NodeConfig::default()
        });
        a.depends_on.add_macro("macro.p.helper");
        manifest.add_node(a).unwrap();
        manifest.add_node(model("b", &["model.p.a"])).unwrap();

        manifest.build_maps();
        assert_eq!(manifest.child_map["model.p.a"], vec!["model.p.b"]);
        assert_eq!(manifest.parent_map["model.p.b"], vec!["model.p.a"]);
        assert_eq!(manifest.macro_child_map["macro.p.helper"], vec!["model.p.a"]);
        assert_eq!(manifest.macro_child_map["macro.p.other"], vec!["macro.p.helper"]);
        assert_eq!(manifest.group_map["finance"], vec!["model.p.a"]);
    }
}
