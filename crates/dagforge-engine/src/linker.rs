//! Graph linking
//!
//! Runs after resolution: derives the manifest maps, assigns relation names
//! and orders the graph.

use crate::relation::{quote_char_for, Relation};
use dagforge_core::TargetConfig;
use dagforge_manifest::{DependencyGraph, Manifest, ManifestError, NodeId};
use std::collections::BTreeSet;

/// Linked graph plus a deterministic execution order
#[derive(Debug, Clone)]
pub struct LinkedGraph {
    pub graph: DependencyGraph,
    pub order: Vec<NodeId>,
}

impl LinkedGraph {
    /// Topological order restricted to `selected`
    pub fn ordered(&self, selected: &BTreeSet<NodeId>) -> Vec<NodeId> {
        self.order.iter().filter(|id| selected.contains(*id)).cloned().collect()
    }
}

/// Build the derived maps, set relation names and sort topologically
pub fn link(manifest: &mut Manifest, target: &TargetConfig) -> Result<LinkedGraph, ManifestError> {
    let graph = manifest.build_maps();
    let quote_char = quote_char_for(&target.adapter_type);

    for node in manifest.nodes.values_mut() {
        node.relation_name = if node.is_refable() && !node.is_ephemeral() {
            Some(
                Relation::new(node.database.clone(), &node.schema, &node.alias)
                    .with_quoting(quote_char, target.quoting)
                    .to_string(),
            )
        } else {
            None
        };
    }
    for source in manifest.sources.values_mut() {
        source.relation_name = Some(
            Relation::for_source(source)
                .with_quoting(quote_char, target.quoting)
                .to_string(),
        );
    }

    let order = graph.topological_sort()?;
    tracing::debug!(nodes = graph.len(), "Linked graph");
    Ok(LinkedGraph { graph, order })
}

/// Ids of ephemeral models
pub fn ephemeral_ids(manifest: &Manifest) -> BTreeSet<NodeId> {
    manifest
        .nodes
        .values()
        .filter(|n| n.is_ephemeral_model())
        .map(|n| n.unique_id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagforge_manifest::{Node, NodeConfig, ResourceType};

    fn model(name: &str) -> Node {
        let mut node = Node::new(ResourceType::Model, "p", name, format!("models/{}.sql", name));
        node.schema = "analytics".to_string();
        node
    }

    #[test]
    fn link_orders_and_names_relations() {
        let mut manifest = Manifest::default();
        let mut b = model("b");
        b.depends_on.add_node("model.p.a");
        let mut eph = model("eph").with_config(NodeConfig::default().with_materialized("ephemeral"));
        eph.depends_on.add_node("model.p.b");
        manifest.add_node(model("a")).unwrap();
        manifest.add_node(b).unwrap();
        manifest.add_node(eph).unwrap();

        let linked = link(&mut manifest, &TargetConfig::default()).unwrap();
        assert_eq!(linked.order, vec!["model.p.a", "model.p.b", "model.p.eph"]);
        assert_eq!(
            manifest.nodes["model.p.a"].relation_name.as_deref(),
            Some("\"analytics\".\"a\"")
        );
        assert!(manifest.nodes["model.p.eph"].relation_name.is_none());
        assert_eq!(ephemeral_ids(&manifest).into_iter().collect::<Vec<_>>(), vec!["model.p.eph"]);
        assert_eq!(manifest.child_map["model.p.a"], vec!["model.p.b"]);
    }

    #[test]
    fn cycles_fail_to_link() {
        let mut manifest = Manifest::default();
        let mut a = model("a");
        a.depends_on.add_node("model.p.b");
        let mut b = model("b");
        b.depends_on.add_node("model.p.a");
        manifest.add_node(a).unwrap();
        manifest.add_node(b).unwrap();
        assert!(matches!(
            link(&mut manifest, &TargetConfig::default()),
            Err(ManifestError::Cycle { .. })
        ));
    }
}
