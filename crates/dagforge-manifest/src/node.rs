//! Executable nodes and their rendered configuration

use dagforge_core::FileHash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Resource kinds that appear in unique ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Model,
    Seed,
    Snapshot,
    Test,
    Analysis,
    Operation,
    UnitTest,
    Source,
    Macro,
    Doc,
    Exposure,
    Metric,
    Group,
    SemanticModel,
    SavedQuery,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Model => "model",
            ResourceType::Seed => "seed",
            ResourceType::Snapshot => "snapshot",
            ResourceType::Test => "test",
            ResourceType::Analysis => "analysis",
            ResourceType::Operation => "operation",
            ResourceType::UnitTest => "unit_test",
            ResourceType::Source => "source",
            ResourceType::Macro => "macro",
            ResourceType::Doc => "doc",
            ResourceType::Exposure => "exposure",
            ResourceType::Metric => "metric",
            ResourceType::Group => "group",
            ResourceType::SemanticModel => "semantic_model",
            ResourceType::SavedQuery => "saved_query",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "model" => ResourceType::Model,
            "seed" => ResourceType::Seed,
            "snapshot" => ResourceType::Snapshot,
            "test" => ResourceType::Test,
            "analysis" => ResourceType::Analysis,
            "operation" => ResourceType::Operation,
            "unit_test" => ResourceType::UnitTest,
            "source" => ResourceType::Source,
            "macro" => ResourceType::Macro,
            "doc" => ResourceType::Doc,
            "exposure" => ResourceType::Exposure,
            "metric" => ResourceType::Metric,
            "group" => ResourceType::Group,
            "semantic_model" => ResourceType::SemanticModel,
            "saved_query" => ResourceType::SavedQuery,
            _ => return None,
        })
    }

    /// Kinds that `ref()` can target
    pub fn is_refable(&self) -> bool {
        matches!(
            self,
            ResourceType::Model | ResourceType::Seed | ResourceType::Snapshot | ResourceType::Analysis
        )
    }

    /// Kinds a runner executes
    pub fn is_executable(&self) -> bool {
        matches!(
            self,
            ResourceType::Model
                | ResourceType::Seed
                | ResourceType::Snapshot
                | ResourceType::Test
                | ResourceType::Operation
                | ResourceType::UnitTest
        )
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build a unique id: `<kind>.<package>.<name>[.v<version>]`
pub fn unique_id(resource_type: ResourceType, package: &str, name: &str, version: Option<&str>) -> String {
    match version {
        Some(v) => format!("{}.{}.{}.v{}", resource_type, package, name, v),
        None => format!("{}.{}.{}", resource_type, package, name),
    }
}

/// Template language of a node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Sql,
    Python,
}

/// Access modifier of a refable node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    Public,
    #[default]
    Protected,
    Private,
}

impl Access {
    pub fn as_str(&self) -> &'static str {
        match self {
            Access::Public => "public",
            Access::Protected => "protected",
            Access::Private => "private",
        }
    }
}

/// Arguments of a `ref()` call
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RefArgs {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl RefArgs {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            package: None,
            version: None,
        }
    }

    pub fn with_package(mut self, package: impl Into<String>) -> Self {
        self.package = Some(package.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Lookup key: `name` or `name.v<version>`
    pub fn search_name(&self) -> String {
        match &self.version {
            Some(v) => format!("{}.v{}", self.name, v),
            None => self.name.clone(),
        }
    }
}

impl std::fmt::Display for RefArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.package {
            Some(pkg) => write!(f, "ref('{}', '{}'", pkg, self.name)?,
            None => write!(f, "ref('{}'", self.name)?,
        }
        if let Some(v) = &self.version {
            write!(f, ", v={}", v)?;
        }
        f.write_str(")")
    }
}

/// An `adapter.dispatch` call site recorded during parsing
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DispatchRef {
    pub macro_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Resolved dependencies
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependsOn {
    /// Macro unique ids
    #[serde(default)]
    pub macros: Vec<String>,

    /// Node and source unique ids
    #[serde(default)]
    pub nodes: Vec<String>,
}

impl DependsOn {
    pub fn add_node(&mut self, unique_id: impl Into<String>) {
        let id = unique_id.into();
        if !self.nodes.contains(&id) {
            self.nodes.push(id);
        }
    }

    pub fn add_macro(&mut self, unique_id: impl Into<String>) {
        let id = unique_id.into();
        if !self.macros.contains(&id) {
            self.macros.push(id);
        }
    }

    /// Sort and deduplicate both lists
    pub fn normalize(&mut self) {
        self.nodes.sort();
        self.nodes.dedup();
        self.macros.sort();
        self.macros.dedup();
    }
}

/// A pre- or post-hook
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hook {
    pub sql: String,
    #[serde(default = "default_true")]
    pub transaction: bool,
}

/// Contract configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractConfig {
    /// Whether the contract is enforced
    #[serde(default)]
    pub enforced: bool,

    #[serde(default = "default_true")]
    pub alias_types: bool,
}

/// Docs display configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocsConfig {
    #[serde(default = "default_true")]
    pub show: bool,

    #[serde(default)]
    pub node_color: Option<String>,
}

impl Default for DocsConfig {
    fn default() -> Self {
        Self {
            show: true,
            node_color: None,
        }
    }
}

/// Rendered node configuration, produced by the config layering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Whether the node is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Materialization name
    #[serde(default = "default_materialized")]
    pub materialized: String,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub meta: BTreeMap<String, serde_json::Value>,

    #[serde(default, rename = "pre-hook")]
    pub pre_hook: Vec<Hook>,

    #[serde(default, rename = "post-hook")]
    pub post_hook: Vec<Hook>,

    /// Custom database, schema and alias inputs to the name generators
    #[serde(default)]
    pub database: Option<String>,

    #[serde(default)]
    pub schema: Option<String>,

    #[serde(default)]
    pub alias: Option<String>,

    #[serde(default)]
    pub persist_docs: BTreeMap<String, serde_json::Value>,

    #[serde(default)]
    pub quoting: BTreeMap<String, serde_json::Value>,

    #[serde(default)]
    pub column_types: BTreeMap<String, serde_json::Value>,

    #[serde(default)]
    pub full_refresh: Option<bool>,

    #[serde(default)]
    pub unique_key: Option<serde_json::Value>,

    #[serde(default)]
    pub on_schema_change: Option<String>,

    #[serde(default)]
    pub grants: BTreeMap<String, serde_json::Value>,

    #[serde(default)]
    pub contract: ContractConfig,

    #[serde(default)]
    pub docs: DocsConfig,

    #[serde(default)]
    pub access: Access,

    #[serde(default)]
    pub group: Option<String>,

    /// Microbatch settings
    #[serde(default)]
    pub event_time: Option<String>,

    #[serde(default)]
    pub batch_size: Option<String>,

    #[serde(default)]
    pub lookback: Option<i64>,

    #[serde(default)]
    pub begin: Option<String>,

    /// Test settings
    #[serde(default)]
    pub severity: Option<String>,

    #[serde(default, rename = "where")]
    pub where_clause: Option<String>,

    #[serde(default)]
    pub store_failures: Option<bool>,

    #[serde(default)]
    pub sql_header: Option<String>,

    /// Keys without a typed field
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            materialized: default_materialized(),
            tags: Vec::new(),
            meta: BTreeMap::new(),
            pre_hook: Vec::new(),
            post_hook: Vec::new(),
            database: None,
            schema: None,
            alias: None,
            persist_docs: BTreeMap::new(),
            quoting: BTreeMap::new(),
            column_types: BTreeMap::new(),
            full_refresh: None,
            unique_key: None,
            on_schema_change: None,
            grants: BTreeMap::new(),
            contract: ContractConfig::default(),
            docs: DocsConfig::default(),
            access: Access::default(),
            group: None,
            event_time: None,
            batch_size: None,
            lookback: None,
            begin: None,
            severity: None,
            where_clause: None,
            store_failures: None,
            sql_header: None,
            extra: BTreeMap::new(),
        }
    }
}

impl NodeConfig {
    pub fn with_materialized(mut self, materialized: impl Into<String>) -> Self {
        self.materialized = materialized.into();
        self
    }

    pub fn is_ephemeral(&self) -> bool {
        self.materialized == "ephemeral"
    }
}

fn default_true() -> bool {
    true
}

fn default_materialized() -> String {
    "view".to_string()
}

/// Column declared in YAML
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Data type (if specified in contract)
    #[serde(default)]
    pub data_type: Option<String>,

    #[serde(default)]
    pub meta: BTreeMap<String, serde_json::Value>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub quote: Option<bool>,
}

/// Generic test invocation details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestMetadata {
    pub name: String,

    #[serde(default)]
    pub kwargs: BTreeMap<String, serde_json::Value>,

    #[serde(default)]
    pub namespace: Option<String>,
}

/// An ephemeral CTE spliced into a compiled node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectedCte {
    pub id: String,
    pub sql: String,
}

/// Relation copied from a reference manifest by defer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferRelation {
    pub database: Option<String>,
    pub schema: String,
    pub alias: String,
    pub relation_name: Option<String>,
}

/// A node: model, seed, snapshot, test, analysis or operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier (e.g., "model.my_project.users")
    pub unique_id: String,

    pub name: String,

    pub resource_type: ResourceType,

    pub package_name: String,

    /// Path relative to the resource directory
    pub path: String,

    /// Path relative to the package root
    pub original_file_path: String,

    #[serde(default)]
    pub fqn: Vec<String>,

    #[serde(default)]
    pub language: Language,

    #[serde(default)]
    pub raw_code: String,

    #[serde(default)]
    pub checksum: FileHash,

    #[serde(default)]
    pub database: Option<String>,

    #[serde(default)]
    pub schema: String,

    #[serde(default)]
    pub alias: String,

    #[serde(default)]
    pub relation_name: Option<String>,

    #[serde(default)]
    pub config: NodeConfig,

    /// Merged config before rendering; the source of truth for "modified"
    #[serde(default)]
    pub unrendered_config: BTreeMap<String, serde_json::Value>,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub columns: BTreeMap<String, ColumnInfo>,

    #[serde(default)]
    pub refs: Vec<RefArgs>,

    #[serde(default)]
    pub sources: Vec<(String, String)>,

    /// Possible macro calls found by the inspector, resolved into `depends_on.macros`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub macro_calls: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dispatch_calls: Vec<DispatchRef>,

    #[serde(default)]
    pub depends_on: DependsOn,

    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub latest_version: Option<String>,

    /// YAML file that patched this node
    #[serde(default)]
    pub patch_path: Option<String>,

    #[serde(default)]
    pub test_metadata: Option<TestMetadata>,

    #[serde(default)]
    pub column_name: Option<String>,

    /// Node a generic test is attached to
    #[serde(default)]
    pub attached_node: Option<String>,

    #[serde(default)]
    pub compiled: bool,

    #[serde(default)]
    pub compiled_code: Option<String>,

    #[serde(default)]
    pub extra_ctes_injected: bool,

    #[serde(default)]
    pub extra_ctes: Vec<InjectedCte>,

    #[serde(default)]
    pub defer_relation: Option<DeferRelation>,
}

impl Node {
    /// New node with defaults; the unique id is derived from kind, package,
    /// name and version
    pub fn new(
        resource_type: ResourceType,
        package_name: impl Into<String>,
        name: impl Into<String>,
        original_file_path: impl Into<String>,
    ) -> Self {
        let package_name = package_name.into();
        let name = name.into();
        let original_file_path = original_file_path.into();
        Self {
            unique_id: unique_id(resource_type, &package_name, &name, None),
            fqn: vec![package_name.clone(), name.clone()],
            path: original_file_path.clone(),
            alias: name.clone(),
            name,
            resource_type,
            package_name,
            original_file_path,
            language: Language::Sql,
            raw_code: String::new(),
            checksum: FileHash::empty(),
            database: None,
            schema: String::new(),
            relation_name: None,
            config: NodeConfig::default(),
            unrendered_config: BTreeMap::new(),
            description: String::new(),
            columns: BTreeMap::new(),
            refs: Vec::new(),
            sources: Vec::new(),
            macro_calls: Vec::new(),
            dispatch_calls: Vec::new(),
            depends_on: DependsOn::default(),
            version: None,
            latest_version: None,
            patch_path: None,
            test_metadata: None,
            column_name: None,
            attached_node: None,
            compiled: false,
            compiled_code: None,
            extra_ctes_injected: false,
            extra_ctes: Vec::new(),
            defer_relation: None,
        }
    }

    pub fn with_raw_code(mut self, raw_code: impl Into<String>) -> Self {
        self.raw_code = raw_code.into();
        self
    }

    pub fn with_config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_refs(mut self, refs: Vec<RefArgs>) -> Self {
        self.refs = refs;
        self
    }

    /// Set the version and re-derive the unique id
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        let version = version.into();
        self.unique_id = unique_id(self.resource_type, &self.package_name, &self.name, Some(&version));
        self.version = Some(version);
        self
    }

    /// Lookup key: `name` or `name.v<version>`
    pub fn search_name(&self) -> String {
        match &self.version {
            Some(v) => format!("{}.v{}", self.name, v),
            None => self.name.clone(),
        }
    }

    pub fn is_refable(&self) -> bool {
        self.resource_type.is_refable()
    }

    pub fn is_ephemeral(&self) -> bool {
        self.config.is_ephemeral()
    }

    pub fn is_ephemeral_model(&self) -> bool {
        self.resource_type == ResourceType::Model && self.is_ephemeral()
    }

    pub fn is_latest_version(&self) -> bool {
        match (&self.version, &self.latest_version) {
            (Some(v), Some(latest)) => v == latest,
            (None, _) => true,
            (Some(_), None) => false,
        }
    }

    pub fn access(&self) -> Access {
        self.config.access
    }

    pub fn group(&self) -> Option<&str> {
        self.config.group.as_deref()
    }

    pub fn is_generic_test(&self) -> bool {
        self.resource_type == ResourceType::Test && self.test_metadata.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_ids() {
        assert_eq!(unique_id(ResourceType::Model, "shop", "orders", None), "model.shop.orders");
        assert_eq!(unique_id(ResourceType::Model, "shop", "orders", Some("2")), "model.shop.orders.v2");
        let node = Node::new(ResourceType::Model, "shop", "orders", "models/orders.sql").with_version("2");
        assert_eq!(node.unique_id, "model.shop.orders.v2");
        assert_eq!(node.search_name(), "orders.v2");
    }

    #[test]
    fn config_defaults_and_hyphenated_hooks() {
        let config: NodeConfig = serde_json::from_value(serde_json::json!({
            "materialized": "table",
            "pre-hook": [{"sql": "grant select on {{ this }} to reporter"}],
            "custom_key": 1
        }))
        .unwrap();
        assert!(config.enabled);
        assert_eq!(config.materialized, "table");
        assert_eq!(config.pre_hook[0].sql, "grant select on {{ this }} to reporter");
        assert!(config.pre_hook[0].transaction);
        assert_eq!(config.extra["custom_key"], serde_json::json!(1));
        assert_eq!(config.access, Access::Protected);
    }

    #[test]
    fn latest_version() {
        let mut node = Node::new(ResourceType::Model, "p", "m", "models/m.sql").with_version("1");
        node.latest_version = Some("1".to_string());
        assert!(node.is_latest_version());
        node.latest_version = Some("2".to_string());
        assert!(!node.is_latest_version());
    }
}
