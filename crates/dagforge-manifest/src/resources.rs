//! Non-executable resources: sources, macros, docs, exposures, metrics,
//! groups, semantic models, saved queries and unit tests

use crate::node::{ColumnInfo, DependsOn, RefArgs};
use dagforge_core::FileHash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Freshness period
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessPeriod {
    pub count: u32,
    pub period: String,
}

/// Source freshness thresholds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessThreshold {
    #[serde(default)]
    pub warn_after: Option<FreshnessPeriod>,
    #[serde(default)]
    pub error_after: Option<FreshnessPeriod>,
    #[serde(default)]
    pub filter: Option<String>,
}

/// Source configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub event_time: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            event_time: None,
            extra: BTreeMap::new(),
        }
    }
}

/// A table declared under `sources:` in YAML
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDefinition {
    /// `source.<package>.<source_name>.<table_name>`
    pub unique_id: String,

    /// Table name
    pub name: String,

    pub source_name: String,

    pub package_name: String,

    pub original_file_path: String,

    #[serde(default)]
    pub fqn: Vec<String>,

    #[serde(default)]
    pub database: Option<String>,

    pub schema: String,

    pub identifier: String,

    #[serde(default)]
    pub relation_name: Option<String>,

    #[serde(default)]
    pub loader: String,

    #[serde(default)]
    pub loaded_at_field: Option<String>,

    #[serde(default)]
    pub freshness: Option<FreshnessThreshold>,

    #[serde(default)]
    pub quoting: BTreeMap<String, serde_json::Value>,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub columns: BTreeMap<String, ColumnInfo>,

    #[serde(default)]
    pub meta: BTreeMap<String, serde_json::Value>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub config: SourceConfig,

    #[serde(default)]
    pub unrendered_config: BTreeMap<String, serde_json::Value>,
}

impl SourceDefinition {
    pub fn new(
        package_name: impl Into<String>,
        source_name: impl Into<String>,
        name: impl Into<String>,
        original_file_path: impl Into<String>,
    ) -> Self {
        let package_name = package_name.into();
        let source_name = source_name.into();
        let name = name.into();
        Self {
            unique_id: format!("source.{}.{}.{}", package_name, source_name, name),
            fqn: vec![package_name.clone(), source_name.clone(), name.clone()],
            identifier: name.clone(),
            schema: source_name.clone(),
            name,
            source_name,
            package_name,
            original_file_path: original_file_path.into(),
            database: None,
            relation_name: None,
            loader: String::new(),
            loaded_at_field: None,
            freshness: None,
            quoting: BTreeMap::new(),
            description: String::new(),
            columns: BTreeMap::new(),
            meta: BTreeMap::new(),
            tags: Vec::new(),
            config: SourceConfig::default(),
            unrendered_config: BTreeMap::new(),
        }
    }

    /// Lookup key: `source_name.table_name`
    pub fn search_name(&self) -> String {
        format!("{}.{}", self.source_name, self.name)
    }
}

/// Macro argument documentation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroArgument {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "type")]
    pub arg_type: Option<String>,
}

/// Macro dependencies
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroDependsOn {
    #[serde(default)]
    pub macros: Vec<String>,
}

/// A named template macro
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Macro {
    /// `macro.<package>.<name>`
    pub unique_id: String,

    pub name: String,

    pub package_name: String,

    pub original_file_path: String,

    /// Full source of the macro block, tags included
    pub macro_sql: String,

    #[serde(default)]
    pub depends_on: MacroDependsOn,

    /// Possible macro calls found by the inspector
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub macro_calls: Vec<String>,

    #[serde(default)]
    pub arguments: Vec<MacroArgument>,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub patch_path: Option<String>,

    #[serde(default)]
    pub meta: BTreeMap<String, serde_json::Value>,

    #[serde(default)]
    pub supported_languages: Option<Vec<String>>,
}

impl Macro {
    pub fn new(
        package_name: impl Into<String>,
        name: impl Into<String>,
        original_file_path: impl Into<String>,
        macro_sql: impl Into<String>,
    ) -> Self {
        let package_name = package_name.into();
        let name = name.into();
        Self {
            unique_id: format!("macro.{}.{}", package_name, name),
            name,
            package_name,
            original_file_path: original_file_path.into(),
            macro_sql: macro_sql.into(),
            depends_on: MacroDependsOn::default(),
            macro_calls: Vec::new(),
            arguments: Vec::new(),
            description: String::new(),
            patch_path: None,
            meta: BTreeMap::new(),
            supported_languages: None,
        }
    }

    pub fn is_materialization(&self) -> bool {
        self.name.starts_with("materialization_")
    }
}

/// A `{% docs %}` block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Doc {
    /// `doc.<package>.<name>`
    pub unique_id: String,
    pub name: String,
    pub package_name: String,
    pub original_file_path: String,
    pub block_contents: String,
}

/// Owner of an exposure or group
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

/// Downstream consumer of the project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exposure {
    pub unique_id: String,
    pub name: String,
    pub package_name: String,
    pub original_file_path: String,
    #[serde(default)]
    pub fqn: Vec<String>,
    #[serde(rename = "type")]
    pub exposure_type: String,
    #[serde(default)]
    pub owner: Owner,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub refs: Vec<RefArgs>,
    #[serde(default)]
    pub sources: Vec<(String, String)>,
    #[serde(default)]
    pub depends_on: DependsOn,
    #[serde(default)]
    pub meta: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A semantic-layer metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub unique_id: String,
    pub name: String,
    pub package_name: String,
    pub original_file_path: String,
    #[serde(default)]
    pub fqn: Vec<String>,
    #[serde(default)]
    pub label: String,
    #[serde(rename = "type")]
    pub metric_type: String,
    #[serde(default)]
    pub type_params: serde_json::Value,
    #[serde(default)]
    pub description: String,
    /// Metrics this one is defined in terms of
    #[serde(default)]
    pub metrics: Vec<String>,
    #[serde(default)]
    pub depends_on: DependsOn,
    #[serde(default)]
    pub group: Option<String>,
}

/// Ownership group used by access checks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// `group.<package>.<name>`
    pub unique_id: String,
    pub name: String,
    pub package_name: String,
    pub original_file_path: String,
    #[serde(default)]
    pub owner: Owner,
}

impl Group {
    pub fn new(package_name: impl Into<String>, name: impl Into<String>, original_file_path: impl Into<String>) -> Self {
        let package_name = package_name.into();
        let name = name.into();
        Self {
            unique_id: format!("group.{}.{}", package_name, name),
            name,
            package_name,
            original_file_path: original_file_path.into(),
            owner: Owner::default(),
        }
    }
}

/// Semantic model over a single model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticModel {
    pub unique_id: String,
    pub name: String,
    pub package_name: String,
    pub original_file_path: String,
    #[serde(default)]
    pub fqn: Vec<String>,
    /// The `ref(...)` expression naming the underlying model
    pub model: String,
    #[serde(default)]
    pub refs: Vec<RefArgs>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub entities: serde_json::Value,
    #[serde(default)]
    pub dimensions: serde_json::Value,
    #[serde(default)]
    pub measures: serde_json::Value,
    #[serde(default)]
    pub depends_on: DependsOn,
}

/// Saved semantic-layer query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedQuery {
    pub unique_id: String,
    pub name: String,
    pub package_name: String,
    pub original_file_path: String,
    #[serde(default)]
    pub fqn: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub query_params: serde_json::Value,
    #[serde(default)]
    pub depends_on: DependsOn,
}

/// One input or the expectation of a unit test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitTestInput {
    /// `ref(...)` or `source(...)` expression; empty for `expect`
    #[serde(default)]
    pub input: String,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default)]
    pub rows: serde_json::Value,
    #[serde(default)]
    pub fixture: Option<String>,
}

/// Unit test of a model against fixed inputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitTestDefinition {
    /// `unit_test.<package>.<model>.<name>`
    pub unique_id: String,
    pub name: String,
    pub package_name: String,
    pub original_file_path: String,
    #[serde(default)]
    pub fqn: Vec<String>,
    /// Name of the tested model
    pub model: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub given: Vec<UnitTestInput>,
    pub expect: UnitTestInput,
    #[serde(default)]
    pub overrides: Option<serde_json::Value>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub depends_on: DependsOn,
    #[serde(default)]
    pub checksum: FileHash,
}

fn default_true() -> bool {
    true
}

fn default_format() -> String {
    "dict".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_ids_and_defaults() {
        let source = SourceDefinition::new("shop", "raw", "orders", "models/sources.yml");
        assert_eq!(source.unique_id, "source.shop.raw.orders");
        assert_eq!(source.schema, "raw");
        assert_eq!(source.identifier, "orders");
        assert_eq!(source.search_name(), "raw.orders");
        assert!(source.config.enabled);
    }

    #[test]
    fn materialization_macros() {
        let m = Macro::new("dagforge", "materialization_table_default", "macros/m.sql", "");
        assert!(m.is_materialization());
        assert_eq!(m.unique_id, "macro.dagforge.materialization_table_default");
    }
}
