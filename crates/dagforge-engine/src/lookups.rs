//! Lookup indices: `search_name -> package -> unique_id`
//!
//! Indices are rebuilt from the manifest whenever resolution runs; they hold
//! ids only.

use dagforge_manifest::{DisabledEntry, Manifest, Node, ResourceType};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

/// One step of a package search
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchStep {
    Package(String),
    Any,
}

/// Package search order for a reference made from `node_package` while
/// `current_project` is the root
pub fn search_order(target_package: Option<&str>, current_project: &str, node_package: &str) -> Vec<SearchStep> {
    match target_package {
        Some(pkg) => vec![SearchStep::Package(pkg.to_string())],
        None if current_project == node_package => {
            vec![SearchStep::Package(current_project.to_string()), SearchStep::Any]
        }
        None => vec![
            SearchStep::Package(current_project.to_string()),
            SearchStep::Package(node_package.to_string()),
            SearchStep::Any,
        ],
    }
}

/// Several packages matched in the `any` step; ids are sorted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ambiguity(pub Vec<String>);

/// `search_name -> package -> unique_id`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageIndex {
    entries: BTreeMap<String, BTreeMap<String, String>>,
    collisions: BTreeMap<String, Vec<String>>,
}

impl PackageIndex {
    /// Index an id; a second id under the same name and package is kept
    /// out of the index and recorded as a collision
    pub fn insert(&mut self, search_name: impl Into<String>, package: impl Into<String>, unique_id: impl Into<String>) {
        let search_name = search_name.into();
        let unique_id = unique_id.into();
        let by_package = self.entries.entry(search_name.clone()).or_default();
        match by_package.entry(package.into()) {
            Entry::Vacant(slot) => {
                slot.insert(unique_id);
            }
            Entry::Occupied(slot) if *slot.get() == unique_id => {}
            Entry::Occupied(slot) => {
                let ids = self.collisions.entry(search_name).or_insert_with(|| vec![slot.get().clone()]);
                if !ids.contains(&unique_id) {
                    ids.push(unique_id);
                }
            }
        }
    }

    /// Names claimed twice within one package, with every claiming id sorted
    pub fn collisions(&self) -> impl Iterator<Item = (&str, Vec<&str>)> {
        self.collisions.iter().map(|(name, ids)| {
            let mut ids: Vec<&str> = ids.iter().map(String::as_str).collect();
            ids.sort_unstable();
            (name.as_str(), ids)
        })
    }

    /// Candidates for a name, keyed by package
    pub fn candidates(&self, search_name: &str) -> Option<&BTreeMap<String, String>> {
        self.entries.get(search_name)
    }

    /// Walk the search order; the first hit wins
    pub fn find(&self, search_name: &str, order: &[SearchStep]) -> Result<Option<&str>, Ambiguity> {
        let Some(by_package) = self.entries.get(search_name) else {
            return Ok(None);
        };
        for step in order {
            match step {
                SearchStep::Package(pkg) => {
                    if let Some(id) = by_package.get(pkg) {
                        return Ok(Some(id.as_str()));
                    }
                }
                SearchStep::Any => {
                    let mut ids: Vec<&String> = by_package.values().collect();
                    return match ids.len() {
                        0 => Ok(None),
                        1 => Ok(Some(ids[0].as_str())),
                        _ => {
                            ids.sort();
                            Err(Ambiguity(ids.into_iter().cloned().collect()))
                        }
                    };
                }
            }
        }
        Ok(None)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// `search_name -> package -> [unique_id]`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisabledIndex {
    entries: BTreeMap<String, BTreeMap<String, Vec<String>>>,
}

impl DisabledIndex {
    pub fn insert(&mut self, search_name: impl Into<String>, package: impl Into<String>, unique_id: impl Into<String>) {
        let ids = self
            .entries
            .entry(search_name.into())
            .or_default()
            .entry(package.into())
            .or_default();
        let id = unique_id.into();
        if !ids.contains(&id) {
            ids.push(id);
        }
    }

    /// Walk the search order; the `any` step returns every package's ids
    pub fn find(&self, search_name: &str, order: &[SearchStep]) -> Option<Vec<String>> {
        let by_package = self.entries.get(search_name)?;
        for step in order {
            match step {
                SearchStep::Package(pkg) => {
                    if let Some(ids) = by_package.get(pkg) {
                        return Some(ids.clone());
                    }
                }
                SearchStep::Any => {
                    let ids: Vec<String> = by_package.values().flatten().cloned().collect();
                    return (!ids.is_empty()).then_some(ids);
                }
            }
        }
        None
    }
}

/// Every index over one manifest
#[derive(Debug, Clone, Default)]
pub struct Lookups {
    pub refable: PackageIndex,
    pub sources: PackageIndex,
    pub docs: PackageIndex,
    pub metrics: PackageIndex,
    pub saved_queries: PackageIndex,
    pub semantic_models_by_measure: PackageIndex,
    pub singular_tests: PackageIndex,
    pub analyses: PackageIndex,
    pub disabled: DisabledIndex,
}

impl Lookups {
    /// Build all indices in one pass per owning map
    pub fn build(manifest: &Manifest) -> Self {
        let mut lookups = Lookups::default();

        for node in manifest.nodes.values() {
            if node.is_refable() {
                for search_name in refable_search_names(node) {
                    lookups.refable.insert(search_name, &node.package_name, &node.unique_id);
                }
            }
            match node.resource_type {
                ResourceType::Analysis => lookups.analyses.insert(&node.name, &node.package_name, &node.unique_id),
                ResourceType::Test if !node.is_generic_test() => {
                    lookups
                        .singular_tests
                        .insert(&node.name, &node.package_name, &node.unique_id)
                }
                _ => {}
            }
        }

        for source in manifest.sources.values() {
            lookups
                .sources
                .insert(source.search_name(), &source.package_name, &source.unique_id);
        }
        for doc in manifest.docs.values() {
            lookups.docs.insert(&doc.name, &doc.package_name, &doc.unique_id);
        }
        for metric in manifest.metrics.values() {
            lookups.metrics.insert(&metric.name, &metric.package_name, &metric.unique_id);
        }
        for query in manifest.saved_queries.values() {
            lookups
                .saved_queries
                .insert(&query.name, &query.package_name, &query.unique_id);
        }
        for model in manifest.semantic_models.values() {
            if let Some(measures) = model.measures.as_array() {
                for measure in measures {
                    if let Some(name) = measure.get("name").and_then(|n| n.as_str()) {
                        lookups
                            .semantic_models_by_measure
                            .insert(name, &model.package_name, &model.unique_id);
                    }
                }
            }
        }

        for entries in manifest.disabled.values() {
            for entry in entries {
                match entry {
                    DisabledEntry::Node(node) if node.is_refable() => {
                        for search_name in refable_search_names(node) {
                            lookups
                                .disabled
                                .insert(search_name, &node.package_name, &node.unique_id);
                        }
                    }
                    DisabledEntry::Source(source) => {
                        lookups
                            .disabled
                            .insert(source.search_name(), &source.package_name, &source.unique_id);
                    }
                    DisabledEntry::Node(_) => {}
                }
            }
        }

        lookups
    }
}

/// `name.vN` always, plus `name` for the latest version or an unversioned node
fn refable_search_names(node: &Node) -> Vec<String> {
    match &node.version {
        Some(_) if node.is_latest_version() => vec![node.search_name(), node.name.clone()],
        Some(_) => vec![node.search_name()],
        None => vec![node.name.clone()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(pkg: &str, name: &str) -> Node {
        Node::new(ResourceType::Model, pkg, name, format!("models/{}.sql", name))
    }

    #[test]
    fn search_orders() {
        assert_eq!(
            search_order(Some("x"), "root", "root"),
            vec![SearchStep::Package("x".to_string())]
        );
        assert_eq!(
            search_order(None, "root", "root"),
            vec![SearchStep::Package("root".to_string()), SearchStep::Any]
        );
        assert_eq!(
            search_order(None, "root", "dep"),
            vec![
                SearchStep::Package("root".to_string()),
                SearchStep::Package("dep".to_string()),
                SearchStep::Any
            ]
        );
    }

    #[test]
    fn first_hit_wins_and_any_bucket_is_ambiguous() {
        let mut index = PackageIndex::default();
        index.insert("shared", "pkg_b", "model.pkg_b.shared");
        index.insert("shared", "pkg_a", "model.pkg_a.shared");

        let order = search_order(Some("pkg_a"), "root", "root");
        assert_eq!(index.find("shared", &order), Ok(Some("model.pkg_a.shared")));

        let order = search_order(None, "root", "root");
        assert_eq!(
            index.find("shared", &order),
            Err(Ambiguity(vec![
                "model.pkg_a.shared".to_string(),
                "model.pkg_b.shared".to_string()
            ]))
        );

        index.insert("shared", "root", "model.root.shared");
        assert_eq!(index.find("shared", &order), Ok(Some("model.root.shared")));
    }

    #[test]
    fn same_package_claims_are_collisions_not_overwrites() {
        let mut manifest = Manifest::default();
        manifest.add_node(model("p", "orders")).unwrap();
        manifest
            .add_node(Node::new(ResourceType::Seed, "p", "orders", "seeds/orders.csv"))
            .unwrap();
        manifest.add_node(model("q", "orders")).unwrap();

        let lookups = Lookups::build(&manifest);
        let order = search_order(Some("p"), "p", "p");
        assert_eq!(lookups.refable.find("orders", &order), Ok(Some("model.p.orders")));
        let collisions: Vec<_> = lookups.refable.collisions().collect();
        assert_eq!(collisions, vec![("orders", vec!["model.p.orders", "seed.p.orders"])]);
    }

    #[test]
    fn versioned_models_index_latest_under_bare_name() {
        let mut manifest = Manifest::default();
        for v in ["1", "2"] {
            let mut node = model("p", "dim").with_version(v);
            node.latest_version = Some("1".to_string());
            manifest.add_node(node).unwrap();
        }
        let lookups = Lookups::build(&manifest);
        let order = search_order(None, "p", "p");
        assert_eq!(lookups.refable.find("dim", &order), Ok(Some("model.p.dim.v1")));
        assert_eq!(lookups.refable.find("dim.v2", &order), Ok(Some("model.p.dim.v2")));
        assert_eq!(lookups.refable.find("dim.v1", &order), Ok(Some("model.p.dim.v1")));
    }

    #[test]
    fn disabled_nodes_are_indexed_separately() {
        let mut manifest = Manifest::default();
        let mut b = model("p", "b");
        b.config.enabled = false;
        manifest.add_disabled(DisabledEntry::Node(b));
        let lookups = Lookups::build(&manifest);
        let order = search_order(None, "p", "p");
        assert_eq!(lookups.refable.find("b", &order), Ok(None));
        assert_eq!(lookups.disabled.find("b", &order), Some(vec!["model.p.b".to_string()]));
    }
}
