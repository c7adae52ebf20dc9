//! The manifest: every parsed resource plus derived maps
//!
//! Serialized as versioned JSON (`target/manifest.json`). All maps are
//! ordered so writing the same manifest twice yields identical bytes.

use crate::files::{FileRecord, ManifestStateCheck};
use crate::node::{Node, ResourceType};
use crate::resources::{
    Doc, Exposure, Group, Macro, Metric, SavedQuery, SemanticModel, SourceDefinition, UnitTestDefinition,
};
use dagforge_core::{Diagnostic, DiagnosticCode, SecretScrubber};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Current manifest schema version
pub const MANIFEST_SCHEMA_VERSION: u32 = 12;

/// How many older schema versions can still be read
pub const COMPATIBILITY_WINDOW: u32 = 4;

/// Schema URL written to `metadata.dbt_schema_version`
pub fn schema_url(version: u32) -> String {
    format!("https://schemas.dagforge.dev/manifest/v{}.json", version)
}

/// Extract N from `.../manifest/vN.json`
pub fn parse_schema_version(url: &str) -> Option<u32> {
    let file = url.rsplit('/').next()?;
    file.strip_prefix('v')?.strip_suffix(".json")?.parse().ok()
}

/// Manifest metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub dbt_schema_version: String,

    /// Version of the tool that wrote the manifest
    pub dagforge_version: String,

    pub generated_at: String,

    #[serde(default)]
    pub invocation_id: Option<String>,

    #[serde(default)]
    pub user_id: Option<String>,

    #[serde(default)]
    pub project_name: Option<String>,

    #[serde(default)]
    pub adapter_type: Option<String>,
}

impl Default for ManifestMetadata {
    fn default() -> Self {
        Self {
            dbt_schema_version: schema_url(MANIFEST_SCHEMA_VERSION),
            dagforge_version: env!("CARGO_PKG_VERSION").to_string(),
            generated_at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
            invocation_id: None,
            user_id: None,
            project_name: None,
            adapter_type: None,
        }
    }
}

impl ManifestMetadata {
    pub fn new(project_name: impl Into<String>, adapter_type: impl Into<String>) -> Self {
        Self {
            invocation_id: Some(uuid::Uuid::new_v4().to_string()),
            project_name: Some(project_name.into()),
            adapter_type: Some(adapter_type.into()),
            ..Self::default()
        }
    }
}

/// An entry of the disabled multimap
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "disabled_kind", rename_all = "snake_case")]
pub enum DisabledEntry {
    Node(Node),
    Source(SourceDefinition),
}

impl DisabledEntry {
    pub fn unique_id(&self) -> &str {
        match self {
            DisabledEntry::Node(node) => &node.unique_id,
            DisabledEntry::Source(source) => &source.unique_id,
        }
    }

    pub fn original_file_path(&self) -> &str {
        match self {
            DisabledEntry::Node(node) => &node.original_file_path,
            DisabledEntry::Source(source) => &source.original_file_path,
        }
    }

    pub fn as_node(&self) -> Option<&Node> {
        match self {
            DisabledEntry::Node(node) => Some(node),
            DisabledEntry::Source(_) => None,
        }
    }
}

/// Manifest structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Metadata about the manifest
    pub metadata: ManifestMetadata,

    /// Models, seeds, snapshots, tests, analyses and operations
    #[serde(default)]
    pub nodes: BTreeMap<String, Node>,

    /// Source definitions
    #[serde(default)]
    pub sources: BTreeMap<String, SourceDefinition>,

    #[serde(default)]
    pub macros: BTreeMap<String, Macro>,

    #[serde(default)]
    pub docs: BTreeMap<String, Doc>,

    #[serde(default)]
    pub exposures: BTreeMap<String, Exposure>,

    #[serde(default)]
    pub metrics: BTreeMap<String, Metric>,

    #[serde(default)]
    pub groups: BTreeMap<String, Group>,

    #[serde(default)]
    pub semantic_models: BTreeMap<String, SemanticModel>,

    #[serde(default)]
    pub saved_queries: BTreeMap<String, SavedQuery>,

    #[serde(default)]
    pub unit_tests: BTreeMap<String, UnitTestDefinition>,

    /// Disabled resources; one unique id may map to several entries
    #[serde(default)]
    pub disabled: BTreeMap<String, Vec<DisabledEntry>>,

    /// Node -> disabled nodes it references
    #[serde(default)]
    pub disabled_refs: BTreeMap<String, Vec<String>>,

    /// Parent map (node -> list of parent nodes)
    #[serde(default)]
    pub parent_map: BTreeMap<String, Vec<String>>,

    /// Child map (node -> list of child nodes)
    #[serde(default)]
    pub child_map: BTreeMap<String, Vec<String>>,

    /// Macro -> macros and nodes that call it
    #[serde(default)]
    pub macro_child_map: BTreeMap<String, Vec<String>>,

    /// Group name -> member ids
    #[serde(default)]
    pub group_map: BTreeMap<String, Vec<String>>,

    /// Parsed files keyed by `<package>://<path>`
    #[serde(default)]
    pub files: BTreeMap<String, FileRecord>,

    #[serde(default)]
    pub state_check: ManifestStateCheck,
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new(ManifestMetadata::default())
    }
}

impl Manifest {
    pub fn new(metadata: ManifestMetadata) -> Self {
        Self {
            metadata,
            nodes: BTreeMap::new(),
            sources: BTreeMap::new(),
            macros: BTreeMap::new(),
            docs: BTreeMap::new(),
            exposures: BTreeMap::new(),
            metrics: BTreeMap::new(),
            groups: BTreeMap::new(),
            semantic_models: BTreeMap::new(),
            saved_queries: BTreeMap::new(),
            unit_tests: BTreeMap::new(),
            disabled: BTreeMap::new(),
            disabled_refs: BTreeMap::new(),
            parent_map: BTreeMap::new(),
            child_map: BTreeMap::new(),
            macro_child_map: BTreeMap::new(),
            group_map: BTreeMap::new(),
            files: BTreeMap::new(),
            state_check: ManifestStateCheck::default(),
        }
    }

    /// Load manifest from file
    pub fn from_file(path: &Path) -> Result<Self, ManifestError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ManifestError::IoError(path.display().to_string(), e.to_string()))?;

        Self::from_str(&contents)
    }

    /// Parse manifest from JSON string, checking the schema version first
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(json: &str) -> Result<Self, ManifestError> {
        #[derive(Deserialize)]
        struct Header {
            metadata: HeaderMetadata,
        }
        #[derive(Deserialize)]
        struct HeaderMetadata {
            dbt_schema_version: String,
        }

        let header: Header = serde_json::from_str(json).map_err(|e| ManifestError::ParseError(e.to_string()))?;
        check_schema_version(&header.metadata.dbt_schema_version)?;

        serde_json::from_str(json).map_err(|e| ManifestError::ParseError(e.to_string()))
    }

    /// Serialize with secrets scrubbed
    pub fn to_json(&self, scrubber: &SecretScrubber) -> Result<String, ManifestError> {
        let mut value = serde_json::to_value(self).map_err(|e| ManifestError::ParseError(e.to_string()))?;
        scrubber.scrub_json(&mut value);
        serde_json::to_string_pretty(&value).map_err(|e| ManifestError::ParseError(e.to_string()))
    }

    /// Write to `path`, creating parent directories
    pub fn write(&self, path: &Path, scrubber: &SecretScrubber) -> Result<(), ManifestError> {
        let json = self.to_json(scrubber)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ManifestError::IoError(parent.display().to_string(), e.to_string()))?;
        }
        std::fs::write(path, json).map_err(|e| ManifestError::IoError(path.display().to_string(), e.to_string()))
    }

    /// Add an enabled node; a second node with the same id is an error
    pub fn add_node(&mut self, node: Node) -> Result<(), ManifestError> {
        if let Some(existing) = self.nodes.get(&node.unique_id) {
            return Err(ManifestError::DuplicateResource {
                unique_id: node.unique_id.clone(),
                first: existing.original_file_path.clone(),
                second: node.original_file_path.clone(),
            });
        }
        self.nodes.insert(node.unique_id.clone(), node);
        Ok(())
    }

    pub fn add_source(&mut self, source: SourceDefinition) -> Result<(), ManifestError> {
        insert_unique(&mut self.sources, source.unique_id.clone(), source, |s| &s.original_file_path)
    }

    pub fn add_macro(&mut self, mac: Macro) -> Result<(), ManifestError> {
        if let Some(existing) = self.macros.get(&mac.unique_id) {
            return Err(ManifestError::DuplicateMacro {
                unique_id: mac.unique_id.clone(),
                first: existing.original_file_path.clone(),
                second: mac.original_file_path.clone(),
            });
        }
        self.macros.insert(mac.unique_id.clone(), mac);
        Ok(())
    }

    pub fn add_doc(&mut self, doc: Doc) -> Result<(), ManifestError> {
        insert_unique(&mut self.docs, doc.unique_id.clone(), doc, |d| &d.original_file_path)
    }

    pub fn add_exposure(&mut self, exposure: Exposure) -> Result<(), ManifestError> {
        insert_unique(&mut self.exposures, exposure.unique_id.clone(), exposure, |e| {
            &e.original_file_path
        })
    }

    pub fn add_metric(&mut self, metric: Metric) -> Result<(), ManifestError> {
        insert_unique(&mut self.metrics, metric.unique_id.clone(), metric, |m| &m.original_file_path)
    }

    pub fn add_group(&mut self, group: Group) -> Result<(), ManifestError> {
        insert_unique(&mut self.groups, group.unique_id.clone(), group, |g| &g.original_file_path)
    }

    pub fn add_semantic_model(&mut self, model: SemanticModel) -> Result<(), ManifestError> {
        insert_unique(&mut self.semantic_models, model.unique_id.clone(), model, |m| {
            &m.original_file_path
        })
    }

    pub fn add_saved_query(&mut self, query: SavedQuery) -> Result<(), ManifestError> {
        insert_unique(&mut self.saved_queries, query.unique_id.clone(), query, |q| {
            &q.original_file_path
        })
    }

    pub fn add_unit_test(&mut self, test: UnitTestDefinition) -> Result<(), ManifestError> {
        insert_unique(&mut self.unit_tests, test.unique_id.clone(), test, |t| &t.original_file_path)
    }

    /// Append to the disabled multimap
    pub fn add_disabled(&mut self, entry: DisabledEntry) {
        self.disabled
            .entry(entry.unique_id().to_string())
            .or_default()
            .push(entry);
    }

    /// Move exactly one disabled entry back into the enabled maps
    pub fn enable_disabled(&mut self, unique_id: &str) -> Result<bool, ManifestError> {
        let Some(entries) = self.disabled.get_mut(unique_id) else {
            return Ok(false);
        };
        if entries.is_empty() {
            return Ok(false);
        }
        let entry = entries.remove(0);
        if entries.is_empty() {
            self.disabled.remove(unique_id);
        }
        match entry {
            DisabledEntry::Node(mut node) => {
                node.config.enabled = true;
                self.add_node(node)?;
            }
            DisabledEntry::Source(mut source) => {
                source.config.enabled = true;
                self.add_source(source)?;
            }
        }
        Ok(true)
    }

    pub fn add_file(&mut self, record: FileRecord) {
        self.files.insert(record.file_id(), record);
    }

    /// Get a specific node by unique_id
    pub fn get_node(&self, unique_id: &str) -> Option<&Node> {
        self.nodes.get(unique_id)
    }

    /// Get a specific source by unique_id
    pub fn get_source(&self, unique_id: &str) -> Option<&SourceDefinition> {
        self.sources.get(unique_id)
    }

    /// Get all model nodes
    pub fn models(&self) -> impl Iterator<Item = &Node> {
        self.nodes
            .values()
            .filter(|node| node.resource_type == ResourceType::Model)
    }

    /// First disabled entry for an id
    pub fn get_disabled(&self, unique_id: &str) -> Option<&DisabledEntry> {
        self.disabled.get(unique_id).and_then(|entries| entries.first())
    }

    /// Whether an id names any enabled resource
    pub fn contains(&self, unique_id: &str) -> bool {
        self.nodes.contains_key(unique_id)
            || self.sources.contains_key(unique_id)
            || self.macros.contains_key(unique_id)
            || self.exposures.contains_key(unique_id)
            || self.metrics.contains_key(unique_id)
            || self.semantic_models.contains_key(unique_id)
            || self.saved_queries.contains_key(unique_id)
            || self.unit_tests.contains_key(unique_id)
    }

    /// Record that `node_id` references the disabled `disabled_id`
    pub fn add_disabled_ref(&mut self, node_id: &str, disabled_id: &str) {
        let list = self.disabled_refs.entry(node_id.to_string()).or_default();
        if !list.iter().any(|id| id == disabled_id) {
            list.push(disabled_id.to_string());
            list.sort();
        }
    }

    /// Remove everything a file contributed. Used before re-parsing it.
    pub fn remove_file(&mut self, file_id: &str) -> Option<FileRecord> {
        let record = self.files.remove(file_id)?;
        for id in &record.contributed {
            self.nodes.remove(id);
            self.sources.remove(id);
            self.macros.remove(id);
            self.docs.remove(id);
            self.exposures.remove(id);
            self.metrics.remove(id);
            self.groups.remove(id);
            self.semantic_models.remove(id);
            self.saved_queries.remove(id);
            self.unit_tests.remove(id);
            if let Some(entries) = self.disabled.get_mut(id) {
                entries.retain(|e| {
                    !(e.original_file_path() == record.path
                        && entry_package(e) == record.package_name)
                });
                if entries.is_empty() {
                    self.disabled.remove(id);
                }
            }
        }
        Some(record)
    }

    /// Count of enabled resources by kind, for logging
    pub fn stats(&self) -> BTreeMap<&'static str, usize> {
        let mut stats = BTreeMap::new();
        for node in self.nodes.values() {
            *stats.entry(node.resource_type.as_str()).or_insert(0) += 1;
        }
        stats.insert("source", self.sources.len());
        stats.insert("macro", self.macros.len());
        stats.insert("doc", self.docs.len());
        stats.insert("exposure", self.exposures.len());
        stats.insert("metric", self.metrics.len());
        stats.insert("group", self.groups.len());
        stats.insert("unit_test", self.unit_tests.len());
        stats.insert("disabled", self.disabled.values().map(Vec::len).sum());
        stats
    }
}

fn entry_package(entry: &DisabledEntry) -> &str {
    match entry {
        DisabledEntry::Node(node) => &node.package_name,
        DisabledEntry::Source(source) => &source.package_name,
    }
}

fn insert_unique<T>(
    map: &mut BTreeMap<String, T>,
    unique_id: String,
    value: T,
    path_of: impl Fn(&T) -> &String,
) -> Result<(), ManifestError> {
    if let Some(existing) = map.get(&unique_id) {
        return Err(ManifestError::DuplicateResource {
            first: path_of(existing).clone(),
            second: path_of(&value).clone(),
            unique_id,
        });
    }
    map.insert(unique_id, value);
    Ok(())
}

fn check_schema_version(url: &str) -> Result<(), ManifestError> {
    let found = parse_schema_version(url).ok_or_else(|| ManifestError::IncompatibleSchema {
        found: url.to_string(),
        current: MANIFEST_SCHEMA_VERSION,
    })?;
    if found > MANIFEST_SCHEMA_VERSION || MANIFEST_SCHEMA_VERSION - found > COMPATIBILITY_WINDOW {
        return Err(ManifestError::IncompatibleSchema {
            found: url.to_string(),
            current: MANIFEST_SCHEMA_VERSION,
        });
    }
    Ok(())
}

/// Manifest errors
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("Failed to read manifest file {0}: {1}")]
    IoError(String, String),

    #[error("Failed to parse manifest JSON: {0}")]
    ParseError(String),

    #[error("Incompatible schema: {found} cannot be read by manifest version v{current}")]
    IncompatibleSchema { found: String, current: u32 },

    #[error("Duplicate resource '{unique_id}' defined in {first} and {second}")]
    DuplicateResource {
        unique_id: String,
        first: String,
        second: String,
    },

    #[error("Duplicate macro '{unique_id}' defined in {first} and {second}")]
    DuplicateMacro {
        unique_id: String,
        first: String,
        second: String,
    },

    #[error("Found a cycle: {}", nodes.join(" --> "))]
    Cycle { nodes: Vec<String> },
}

impl ManifestError {
    pub fn code(&self) -> DiagnosticCode {
        match self {
            ManifestError::IoError(..) | ManifestError::ParseError(_) => DiagnosticCode::InternalError,
            ManifestError::IncompatibleSchema { .. } => DiagnosticCode::IncompatibleManifest,
            ManifestError::DuplicateResource { .. } => DiagnosticCode::DuplicateResourceName,
            ManifestError::DuplicateMacro { .. } => DiagnosticCode::DuplicateMacro,
            ManifestError::Cycle { .. } => DiagnosticCode::GraphCycle,
        }
    }

    pub fn to_diagnostic(&self) -> Diagnostic {
        let diagnostic = Diagnostic::error(self.code(), self.to_string());
        match self {
            ManifestError::DuplicateResource { unique_id, .. } | ManifestError::DuplicateMacro { unique_id, .. } => {
                diagnostic.with_nodes([unique_id.clone()])
            }
            ManifestError::Cycle { nodes } => diagnostic.with_nodes(nodes.clone()),
            _ => diagnostic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeConfig;
    use pretty_assertions::assert_eq;

    fn model(name: &str) -> Node {
        Node::new(ResourceType::Model, "shop", name, format!("models/{}.sql", name))
    }

    #[test]
    fn duplicate_nodes_are_rejected() {
        let mut manifest = Manifest::default();
        manifest.add_node(model("orders")).unwrap();
        let err = manifest.add_node(model("orders")).unwrap_err();
        assert_eq!(err.code(), DiagnosticCode::DuplicateResourceName);
        assert!(err.to_string().contains("model.shop.orders"));
    }

    #[test]
    fn disabled_is_a_multiset() {
        let mut manifest = Manifest::default();
        let disabled = model("b").with_config(NodeConfig {
            enabled: false,
            ..NodeConfig::default()
        });
        manifest.add_disabled(DisabledEntry::Node(disabled.clone()));
        manifest.add_disabled(DisabledEntry::Node(disabled));
        assert_eq!(manifest.disabled["model.shop.b"].len(), 2);

        assert!(manifest.enable_disabled("model.shop.b").unwrap());
        assert_eq!(manifest.disabled["model.shop.b"].len(), 1);
        assert!(manifest.nodes["model.shop.b"].config.enabled);
    }

    #[test]
    fn serialization_is_deterministic() {
        let mut metadata = ManifestMetadata::default();
        metadata.generated_at = "2024-01-01T00:00:00Z".to_string();
        let mut manifest = Manifest::new(metadata);
        for name in ["zeta", "alpha", "mid"] {
            manifest.add_node(model(name)).unwrap();
        }
        let scrubber = SecretScrubber::default();
        let first = manifest.to_json(&scrubber).unwrap();
        let reloaded = Manifest::from_str(&first).unwrap();
        assert_eq!(first, reloaded.to_json(&scrubber).unwrap());
        let alpha = first.find("model.shop.alpha").unwrap();
        let zeta = first.find("model.shop.zeta").unwrap();
        assert!(alpha < zeta);
    }

    #[test]
    fn schema_window() {
        assert_eq!(parse_schema_version(&schema_url(12)), Some(12));
        assert!(check_schema_version(&schema_url(12)).is_ok());
        assert!(check_schema_version(&schema_url(8)).is_ok());
        assert!(check_schema_version(&schema_url(7)).is_err());
        assert!(check_schema_version(&schema_url(13)).is_err());
    }

    #[test]
    fn incompatible_manifest_is_validation_error() {
        let json = format!(
            r#"{{"metadata": {{"dbt_schema_version": "{}", "dagforge_version": "0.1.0", "generated_at": "x"}}}}"#,
            schema_url(5)
        );
        let err = Manifest::from_str(&json).unwrap_err();
        assert!(err.to_string().contains("Incompatible schema"));
        assert_eq!(err.code().kind(), dagforge_core::ErrorKind::Validation);
    }

    #[test]
    fn remove_file_drops_contributed_ids() {
        use crate::files::{FileRecord, ParseFileType};
        let mut manifest = Manifest::default();
        manifest.add_node(model("orders")).unwrap();
        let mut record = FileRecord::new("shop", "models/orders.sql", ParseFileType::Model, Default::default());
        record.add_contributed("model.shop.orders");
        manifest.add_file(record);
        assert!(manifest.remove_file("shop://models/orders.sql").is_some());
        assert!(manifest.nodes.is_empty());
    }
}
