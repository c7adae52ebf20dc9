//! Node selection
//!
//! Selector syntax: `[N+]method:value[+N]` or a bare node name. A `+` prefix
//! pulls in ancestors, a `+` suffix descendants; an optional number bounds the
//! depth. Whitespace separates selectors, which are unioned. Exclusions are
//! applied last.

use crate::state_comparison::StateComparison;
use dagforge_core::{Diagnostic, DiagnosticCode};
use dagforge_manifest::{DependencyGraph, Manifest, Node, NodeId, SourceDefinition};
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;

static SELECTOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(\d*)(\+))?([^+]+?)(?:(\+)(\d*))?$").expect("valid selector regex")
});

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectionError {
    #[error("Invalid selector '{0}'")]
    InvalidSelector(String),

    #[error("Unknown selection method '{method}' in '{selector}'")]
    UnknownMethod { method: String, selector: String },

    #[error("Selector '{0}' needs a reference manifest (--state)")]
    MissingState(String),
}

impl SelectionError {
    pub fn to_diagnostic(&self) -> Diagnostic {
        Diagnostic::error(DiagnosticCode::ConfigInvalid, self.to_string())
    }
}

/// Selection method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Name,
    Tag,
    Path,
    Package,
    ResourceType,
    Fqn,
    Source,
    State,
}

impl Method {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "tag" => Method::Tag,
            "path" => Method::Path,
            "package" => Method::Package,
            "resource_type" => Method::ResourceType,
            "fqn" => Method::Fqn,
            "source" => Method::Source,
            "state" => Method::State,
            _ => return None,
        })
    }
}

/// Graph operator around a selector: `None` means not requested,
/// `Some(None)` means unbounded
type Depth = Option<Option<usize>>;

/// One parsed selector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    pub method: Method,
    pub value: String,
    pub parents: Depth,
    pub children: Depth,
}

impl Selector {
    pub fn parse(raw: &str) -> Result<Self, SelectionError> {
        let caps = SELECTOR
            .captures(raw)
            .ok_or_else(|| SelectionError::InvalidSelector(raw.to_string()))?;

        let depth = |plus: Option<regex::Match<'_>>, digits: Option<regex::Match<'_>>| -> Depth {
            plus.map(|_| digits.and_then(|d| d.as_str().parse().ok()))
        };
        let parents = depth(caps.get(2), caps.get(1));
        let children = depth(caps.get(4), caps.get(5));
        let body = &caps[3];

        let (method, value) = match body.split_once(':') {
            Some((method, value)) => {
                let parsed = Method::parse(method).ok_or_else(|| SelectionError::UnknownMethod {
                    method: method.to_string(),
                    selector: raw.to_string(),
                })?;
                (parsed, value.to_string())
            }
            None => (Method::Name, body.to_string()),
        };
        if value.is_empty() {
            return Err(SelectionError::InvalidSelector(raw.to_string()));
        }

        Ok(Self {
            method,
            value,
            parents,
            children,
        })
    }
}

/// Include and exclude selectors
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionSpec {
    pub include: Vec<Selector>,
    pub exclude: Vec<Selector>,
}

impl SelectionSpec {
    pub fn parse(select: &[String], exclude: &[String]) -> Result<Self, SelectionError> {
        let split = |args: &[String]| -> Result<Vec<Selector>, SelectionError> {
            args.iter()
                .flat_map(|arg| arg.split_whitespace())
                .map(Selector::parse)
                .collect()
        };
        Ok(Self {
            include: split(select)?,
            exclude: split(exclude)?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }
}

/// Select node ids. An empty include list selects every node.
pub fn select_nodes(
    manifest: &Manifest,
    graph: &DependencyGraph,
    spec: &SelectionSpec,
    state: Option<&Manifest>,
) -> Result<BTreeSet<NodeId>, SelectionError> {
    let mut selected: BTreeSet<NodeId> = if spec.include.is_empty() {
        manifest.nodes.keys().cloned().collect()
    } else {
        let mut ids = BTreeSet::new();
        for selector in &spec.include {
            ids.extend(expand(manifest, graph, selector, state)?);
        }
        ids
    };

    for selector in &spec.exclude {
        for id in expand(manifest, graph, selector, state)? {
            selected.remove(&id);
        }
    }

    selected.retain(|id| manifest.nodes.contains_key(id));
    tracing::debug!(selected = selected.len(), "Selected nodes");
    Ok(selected)
}

fn expand(
    manifest: &Manifest,
    graph: &DependencyGraph,
    selector: &Selector,
    state: Option<&Manifest>,
) -> Result<BTreeSet<NodeId>, SelectionError> {
    let direct = direct_matches(manifest, selector, state)?;
    let mut ids = direct.clone();
    for id in &direct {
        if let Some(depth) = selector.parents {
            ids.extend(graph.ancestors(id, depth));
        }
        if let Some(depth) = selector.children {
            ids.extend(graph.descendants(id, depth));
        }
    }
    Ok(ids)
}

fn direct_matches(
    manifest: &Manifest,
    selector: &Selector,
    state: Option<&Manifest>,
) -> Result<BTreeSet<NodeId>, SelectionError> {
    let value = selector.value.as_str();
    if selector.method == Method::State {
        let reference = state.ok_or_else(|| SelectionError::MissingState(format!("state:{}", value)))?;
        let comparison = StateComparison::compare(manifest, reference);
        return match value {
            "modified" => Ok(comparison.modified_ids()),
            "new" => Ok(comparison.new_nodes.into_iter().collect()),
            _ => Err(SelectionError::InvalidSelector(format!("state:{}", value))),
        };
    }

    if selector.method == Method::Source {
        return Ok(manifest
            .sources
            .values()
            .filter(|source| source_matches(source, value))
            .map(|source| source.unique_id.clone())
            .collect());
    }

    Ok(manifest
        .nodes
        .values()
        .filter(|node| node_matches(node, selector.method, value))
        .map(|node| node.unique_id.clone())
        .collect())
}

fn node_matches(node: &Node, method: Method, value: &str) -> bool {
    match method {
        Method::Name => node.name == value || node.search_name() == value || node.unique_id == value,
        Method::Tag => node.config.tags.iter().any(|t| t == value),
        Method::Path => {
            let prefix = value.trim_end_matches('/');
            node.original_file_path == prefix || node.original_file_path.starts_with(&format!("{}/", prefix))
        }
        Method::Package => node.package_name == value,
        Method::ResourceType => node.resource_type.as_str() == value,
        Method::Fqn => fqn_matches(&node.fqn, value),
        Method::Source | Method::State => false,
    }
}

fn source_matches(source: &SourceDefinition, value: &str) -> bool {
    match value.split_once('.') {
        Some((source_name, table)) => source.source_name == source_name && (table == "*" || source.name == table),
        None => source.source_name == value,
    }
}

/// `a.b` matches fqn `[a, b, ...]`; a trailing `*` segment matches anything
fn fqn_matches(fqn: &[String], value: &str) -> bool {
    let parts: Vec<&str> = value.split('.').collect();
    if parts.len() > fqn.len() {
        return false;
    }
    parts.iter().zip(fqn).all(|(p, f)| *p == "*" || *p == f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagforge_core::FileHash;
    use dagforge_manifest::{NodeConfig, ResourceType};

    fn model(name: &str, dir: &str, deps: &[&str], tags: &[&str]) -> Node {
        let mut node = Node::new(ResourceType::Model, "shop", name, format!("models/{}/{}.sql", dir, name));
        node.fqn = vec!["shop".to_string(), dir.to_string(), name.to_string()];
        node.config = NodeConfig {
            tags: tags.iter().map(|t| t.to_string()).collect(),
            ..NodeConfig::default()
        };
        node.checksum = FileHash::from_contents(name);
        for dep in deps {
            node.depends_on.add_node(*dep);
        }
        node
    }

    fn fixture() -> (Manifest, DependencyGraph) {
        let mut manifest = Manifest::default();
        manifest
            .add_source(SourceDefinition::new("shop", "raw", "orders", "models/sources.yml"))
            .unwrap();
        manifest
            .add_node(model("stg_orders", "staging", &["source.shop.raw.orders"], &["nightly"]))
            .unwrap();
        manifest
            .add_node(model("orders", "marts", &["model.shop.stg_orders"], &[]))
            .unwrap();
        manifest
            .add_node(model("revenue", "marts", &["model.shop.orders"], &["finance"]))
            .unwrap();
        let graph = DependencyGraph::from_manifest(&manifest);
        (manifest, graph)
    }

    fn select(manifest: &Manifest, graph: &DependencyGraph, include: &[&str], exclude: &[&str]) -> Vec<String> {
        let own = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let spec = SelectionSpec::parse(&own(include), &own(exclude)).unwrap();
        select_nodes(manifest, graph, &spec, None).unwrap().into_iter().collect()
    }

    #[test]
    fn parses_graph_operators() {
        let selector = Selector::parse("2+tag:nightly+").unwrap();
        assert_eq!(selector.method, Method::Tag);
        assert_eq!(selector.value, "nightly");
        assert_eq!(selector.parents, Some(Some(2)));
        assert_eq!(selector.children, Some(None));

        let bare = Selector::parse("orders").unwrap();
        assert_eq!(bare.method, Method::Name);
        assert_eq!(bare.parents, None);
    }

    #[test]
    fn rejects_unknown_method() {
        assert!(matches!(
            Selector::parse("colour:red"),
            Err(SelectionError::UnknownMethod { .. })
        ));
    }

    #[test]
    fn empty_selection_is_everything() {
        let (manifest, graph) = fixture();
        assert_eq!(select(&manifest, &graph, &[], &[]).len(), 3);
    }

    #[test]
    fn methods_and_operators() {
        let (manifest, graph) = fixture();
        assert_eq!(select(&manifest, &graph, &["tag:finance"], &[]), vec!["model.shop.revenue"]);
        assert_eq!(
            select(&manifest, &graph, &["path:models/marts"], &[]),
            vec!["model.shop.orders", "model.shop.revenue"]
        );
        assert_eq!(
            select(&manifest, &graph, &["+orders"], &[]),
            vec!["model.shop.orders", "model.shop.stg_orders"]
        );
        assert_eq!(
            select(&manifest, &graph, &["stg_orders+1"], &[]),
            vec!["model.shop.orders", "model.shop.stg_orders"]
        );
        assert_eq!(
            select(&manifest, &graph, &["source:raw.orders+"], &[]).len(),
            3
        );
        assert_eq!(
            select(&manifest, &graph, &["fqn:shop.marts"], &["revenue"]),
            vec!["model.shop.orders"]
        );
    }

    #[test]
    fn state_requires_reference() {
        let (manifest, graph) = fixture();
        let spec = SelectionSpec::parse(&["state:modified".to_string()], &[]).unwrap();
        assert!(matches!(
            select_nodes(&manifest, &graph, &spec, None),
            Err(SelectionError::MissingState(_))
        ));

        let mut reference = manifest.clone();
        reference.nodes.get_mut("model.shop.orders").unwrap().checksum = FileHash::from_contents("old");
        let selected = select_nodes(&manifest, &graph, &spec, Some(&reference)).unwrap();
        assert_eq!(selected.into_iter().collect::<Vec<_>>(), vec!["model.shop.orders"]);
    }
}
