//! Node parsing
//!
//! SQL and Python files become nodes with their refs, sources, macro calls and
//! inline config. YAML patches, versions and relation names are applied once
//! every file has been read.

use crate::error::ParseError;
use crate::ingest::SourceFile;
use crate::python::inspect_python;
use crate::yaml::{version_string, ColumnEntry, ConfigMap, NodePatchEntry, VersionEntry};
use dagforge_core::{Diagnostic, DiagnosticCode, FileHash, TargetConfig};
use dagforge_engine::{CompileOptions, Compiler, Locality, ResolveContext};
use dagforge_jinja::{default_scope, extract_sql_header, inspect, ConfigValue, RefCall, Renderer, SqlHeader, TemplateFacts};
use dagforge_manifest::{unique_id, ColumnInfo, DispatchRef, Language, Manifest, Node, RefArgs, ResourceType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A node as read from its file, before config layering and patches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnpatchedNode {
    pub node: Node,
    /// Inline `config()` values, rendered
    pub inline_config: ConfigMap,
    /// Inline `config()` values as written
    pub unrendered_inline: ConfigMap,
}

/// Base node for a file: fqn from its directories, path below the search root
pub fn base_node(file: &SourceFile, resource_type: ResourceType, name: &str) -> Node {
    let mut node = Node::new(resource_type, &file.package_name, name, &file.path);
    node.path = file.relative_path().to_string();
    node.fqn = std::iter::once(file.package_name.clone())
        .chain(file.subdirectories())
        .chain(std::iter::once(name.to_string()))
        .collect();
    node.checksum = file.checksum.clone();
    node
}

/// A parsed `ref()` call as stored on a node
pub fn ref_args(call: &RefCall) -> RefArgs {
    let mut args = RefArgs::new(&call.name);
    if let Some(package) = &call.package {
        args = args.with_package(package);
    }
    if let Some(version) = &call.version {
        args = args.with_version(version);
    }
    args
}

/// Parse a SQL node body
pub fn parse_sql_node(
    renderer: &Renderer,
    file: &SourceFile,
    resource_type: ResourceType,
    name: &str,
    raw_code: &str,
) -> Result<(UnpatchedNode, TemplateFacts), ParseError> {
    let mut node = base_node(file, resource_type, name).with_raw_code(raw_code);
    let facts = inspect(raw_code, &default_scope())
        .map_err(|e| ParseError::template(&file.path, e.with_source(&file.path, raw_code)))?;

    node.refs = facts.refs.iter().map(ref_args).collect();
    node.sources = facts
        .sources
        .iter()
        .map(|s| (s.source_name.clone(), s.table_name.clone()))
        .collect();
    node.macro_calls = facts.macro_calls.clone();
    node.dispatch_calls = facts
        .dispatch_calls
        .iter()
        .map(|d| DispatchRef {
            macro_name: d.macro_name.clone(),
            namespace: d.namespace.clone(),
        })
        .collect();
    for call in &facts.dynamic_calls {
        tracing::debug!(node = %node.unique_id, call = %call, "Reference with non-literal arguments");
    }

    let mut inline_config = ConfigMap::new();
    let mut unrendered_inline = ConfigMap::new();
    for (key, value) in &facts.configs {
        match value {
            ConfigValue::Literal(v) => {
                inline_config.insert(key.clone(), v.clone());
                unrendered_inline.insert(key.clone(), v.clone());
            }
            ConfigValue::Expression(text) => {
                let evaluated = renderer
                    .eval_expression(text)
                    .map_err(|e| ParseError::template(&file.path, e))?;
                inline_config.insert(key.clone(), evaluated);
                unrendered_inline.insert(key.clone(), Value::String(text.clone()));
            }
        }
    }

    if raw_code.contains("set_sql_header") {
        match extract_sql_header(raw_code).map_err(|e| ParseError::template(&file.path, e))? {
            SqlHeader::Extracted(header) => {
                inline_config.insert("sql_header".to_string(), Value::String(header));
            }
            SqlHeader::Unsupported => {
                tracing::debug!(path = %file.path, "sql header uses unsupported constructs; left to render time")
            }
            SqlHeader::Absent => {}
        }
    }

    Ok((
        UnpatchedNode {
            node,
            inline_config,
            unrendered_inline,
        },
        facts,
    ))
}

/// Parse a Python model
pub fn parse_python_node(file: &SourceFile, name: &str) -> Result<UnpatchedNode, ParseError> {
    let facts = inspect_python(&file.path, &file.contents)?;
    let mut node = base_node(file, ResourceType::Model, name).with_raw_code(&file.contents);
    node.language = Language::Python;
    node.refs = facts.refs;
    node.sources = facts.sources;
    Ok(UnpatchedNode {
        node,
        unrendered_inline: facts.config.clone(),
        inline_config: facts.config,
    })
}

/// Config layers contributed by a YAML patch: `config:` plus the top-level
/// keys that are config in disguise. Returns `(rendered, unrendered)`.
pub fn patch_config_layers(patch: &NodePatchEntry) -> (ConfigMap, ConfigMap) {
    let mut top = ConfigMap::new();
    if let Some(access) = patch.access {
        top.insert("access".to_string(), serde_json::to_value(access).unwrap_or(Value::Null));
    }
    if let Some(group) = &patch.group {
        top.insert("group".to_string(), Value::String(group.clone()));
    }
    if let Some(docs) = &patch.docs {
        top.insert("docs".to_string(), docs.clone());
    }
    if !patch.meta.is_empty() {
        top.insert("meta".to_string(), Value::Object(patch.meta.clone().into_iter().collect()));
    }
    let mut rendered = top.clone();
    rendered.extend(patch.config.clone());
    let mut unrendered = top;
    unrendered.extend(patch.unrendered_config.clone());
    (rendered, unrendered)
}

/// Apply description, columns and patch path from a YAML entry
pub fn apply_patch(node: &mut Node, patch: &NodePatchEntry, version: Option<&VersionEntry>, patch_path: &str) {
    node.description = version
        .and_then(|v| v.description.clone())
        .unwrap_or_else(|| patch.description.clone());
    node.patch_path = Some(patch_path.to_string());

    let mut columns: Vec<ColumnEntry> = patch.columns.clone();
    if let Some(version) = version {
        columns = version_columns(&columns, &version.columns);
    }
    node.columns = column_map(columns);
}

/// YAML columns keyed by name
pub fn column_map(columns: Vec<ColumnEntry>) -> BTreeMap<String, ColumnInfo> {
    columns
        .into_iter()
        .map(|c| {
            let info = ColumnInfo {
                name: c.name.clone(),
                description: c.description,
                data_type: c.data_type,
                meta: c.meta,
                tags: c.tags,
                quote: c.quote,
            };
            (c.name, info)
        })
        .collect()
}

/// Columns of one version: inherited columns filtered by `include`/`exclude`,
/// then overridden or extended by named entries
pub fn version_columns(base: &[ColumnEntry], entries: &[Value]) -> Vec<ColumnEntry> {
    let mut include_all = true;
    let mut include: Vec<String> = Vec::new();
    let mut exclude: Vec<String> = Vec::new();
    let mut overrides: Vec<ColumnEntry> = Vec::new();

    for entry in entries {
        if let Some(inc) = entry.get("include") {
            match inc {
                Value::String(s) if s == "*" || s == "all" => include_all = true,
                Value::Array(items) => {
                    include_all = false;
                    include.extend(items.iter().filter_map(Value::as_str).map(str::to_string));
                }
                _ => {}
            }
            if let Some(Value::Array(items)) = entry.get("exclude") {
                exclude.extend(items.iter().filter_map(Value::as_str).map(str::to_string));
            }
        } else if let Ok(column) = serde_json::from_value::<ColumnEntry>(entry.clone()) {
            overrides.push(column);
        }
    }

    let mut columns: Vec<ColumnEntry> = base
        .iter()
        .filter(|c| (include_all || include.contains(&c.name)) && !exclude.contains(&c.name))
        .cloned()
        .collect();
    for column in overrides {
        match columns.iter_mut().find(|c| c.name == column.name) {
            Some(existing) => *existing = column,
            None => columns.push(column),
        }
    }
    columns
}

/// Version number of a model file bound to a versioned patch: either named in
/// `defined_in` or `<name>_v<version>`
pub fn match_version<'a>(patch: &'a NodePatchEntry, file_stem: &str) -> Option<&'a VersionEntry> {
    patch.versions.iter().find(|v| match &v.defined_in {
        Some(defined_in) => defined_in == file_stem,
        None => file_stem == format!("{}_v{}", patch.name, v.version()),
    })
}

/// Latest version of a versioned patch: declared, or the greatest
pub fn latest_version(patch: &NodePatchEntry, path: &str) -> Result<String, ParseError> {
    let versions: Vec<String> = patch.versions.iter().map(VersionEntry::version).collect();
    match &patch.latest_version {
        Some(declared) => {
            let declared = version_string(declared);
            if versions.contains(&declared) {
                Ok(declared)
            } else {
                Err(ParseError::VersionedModel {
                    path: path.to_string(),
                    model: patch.name.clone(),
                    message: format!("latest_version {} is not one of the declared versions", declared),
                })
            }
        }
        None => versions
            .into_iter()
            .max_by(|a, b| compare_versions(a, b))
            .ok_or_else(|| ParseError::VersionedModel {
                path: path.to_string(),
                model: patch.name.clone(),
                message: "no versions declared".to_string(),
            }),
    }
}

/// Numeric comparison where both sides are numbers, lexical otherwise
pub fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<f64>(), b.parse::<f64>()) {
        (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
        _ => a.cmp(b),
    }
}

/// Rebind a node read from `<name>_v<N>.sql` to its versioned identity
pub fn bind_version(node: &mut Node, model_name: &str, version: &str, latest: &str) {
    let fqn_len = node.fqn.len();
    node.name = model_name.to_string();
    if fqn_len > 0 {
        node.fqn[fqn_len - 1] = model_name.to_string();
    }
    node.fqn.push(format!("v{}", version));
    node.unique_id = unique_id(node.resource_type, &node.package_name, model_name, Some(version));
    node.version = Some(version.to_string());
    node.latest_version = Some(latest.to_string());
    node.alias = model_name.to_string();
}

/// Native `generate_schema_name`
pub fn default_schema(target: &TargetConfig, custom: Option<&str>) -> String {
    match custom.map(str::trim).filter(|c| !c.is_empty()) {
        Some(custom) => format!("{}_{}", target.schema, custom),
        None => target.schema.clone(),
    }
}

/// Native `generate_database_name`
pub fn default_database(target: &TargetConfig, custom: Option<&str>) -> Option<String> {
    custom
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .or_else(|| target.database.clone())
}

/// Native `generate_alias_name`
pub fn default_alias(node: &Node, custom: Option<&str>) -> String {
    if let Some(custom) = custom.map(str::trim).filter(|c| !c.is_empty()) {
        return custom.to_string();
    }
    match &node.version {
        Some(v) => format!("{}_v{}", node.name, v),
        None => node.name.clone(),
    }
}

const GENERATORS: [&str; 3] = ["generate_schema_name", "generate_database_name", "generate_alias_name"];

/// Fill in `database`, `schema` and `alias` for every node
///
/// A generator defined in the root project is rendered; otherwise the native
/// default runs. Errors from a rendered override are returned as diagnostics
/// and the node keeps the native names.
pub fn generate_names(manifest: &mut Manifest, target: &TargetConfig, resolve: &ResolveContext) -> Vec<Diagnostic> {
    let overrides: BTreeMap<&str, String> = {
        let resolver = resolve.macro_resolver(manifest);
        GENERATORS
            .iter()
            .filter_map(|name| {
                let found = resolver.find_generate_macro_by_name(name, None)?;
                (resolver.locality(&found.package_name) == Locality::Root).then(|| (*name, found.unique_id.clone()))
            })
            .collect()
    };

    for node in manifest.nodes.values_mut() {
        node.schema = default_schema(target, node.config.schema.as_deref());
        node.database = default_database(target, node.config.database.as_deref());
        node.alias = default_alias(node, node.config.alias.as_deref());

        if node.resource_type == ResourceType::Snapshot {
            if let Some(schema) = node.config.extra.get("target_schema").and_then(Value::as_str) {
                node.schema = schema.to_string();
            }
            if let Some(database) = node.config.extra.get("target_database").and_then(Value::as_str) {
                node.database = Some(database.to_string());
            }
        }
    }
    if overrides.is_empty() {
        return Vec::new();
    }

    let mut diagnostics = Vec::new();
    let mut compiler = Compiler::new(
        Arc::new(manifest.clone()),
        CompileOptions::new(target.clone(), resolve.clone()),
    );
    let ids: Vec<String> = manifest
        .nodes
        .values()
        .filter(|n| n.resource_type != ResourceType::Operation)
        .map(|n| n.unique_id.clone())
        .collect();

    for id in ids {
        let Some(node) = manifest.nodes.get(&id) else { continue };
        let node_value = minijinja::Value::from_serialize(node);
        let mut generated: BTreeMap<&str, String> = BTreeMap::new();
        for (generator, macro_id) in &overrides {
            let (arg, custom) = match *generator {
                "generate_schema_name" => ("custom_schema_name", node.config.schema.clone()),
                "generate_database_name" => ("custom_database_name", node.config.database.clone()),
                _ => ("custom_alias_name", node.config.alias.clone()),
            };
            let mut extra = BTreeMap::new();
            extra.insert(arg.to_string(), minijinja::Value::from_serialize(&custom));
            extra.insert("node".to_string(), node_value.clone());
            match compiler.render_macro(&id, macro_id, &[arg, "node"], extra) {
                Ok(output) => {
                    generated.insert(generator, output.trim().to_string());
                }
                Err(e) => diagnostics.push(
                    Diagnostic::error(DiagnosticCode::RenderError, format!("{}: {}", generator, e))
                        .with_nodes([id.clone()]),
                ),
            }
        }

        let Some(node) = manifest.nodes.get_mut(&id) else { continue };
        if let Some(schema) = generated.remove("generate_schema_name") {
            node.schema = schema;
        }
        if let Some(database) = generated.remove("generate_database_name") {
            node.database = (!database.is_empty() && database != "none" && database != "None").then_some(database);
        }
        if let Some(alias) = generated.remove("generate_alias_name") {
            node.alias = alias;
        }
    }
    diagnostics
}

/// Seeds are hashed by content and have no code to render
pub fn parse_seed(file: &SourceFile) -> UnpatchedNode {
    let mut node = base_node(file, ResourceType::Seed, file.stem());
    node.checksum = FileHash::from_contents(&file.contents);
    node.config.materialized = "seed".to_string();
    let mut inline_config = ConfigMap::new();
    inline_config.insert("materialized".to_string(), Value::from("seed"));
    UnpatchedNode {
        node,
        unrendered_inline: ConfigMap::new(),
        inline_config,
    }
}

/// Column data types declared in YAML become seed `column_types`
pub fn seed_column_types(patch: &NodePatchEntry) -> ConfigMap {
    let types: serde_json::Map<String, Value> = patch
        .columns
        .iter()
        .filter_map(|c| c.data_type.as_ref().map(|t| (c.name.clone(), Value::String(t.clone()))))
        .collect();
    let mut layer = ConfigMap::new();
    if !types.is_empty() {
        layer.insert("column_types".to_string(), Value::Object(types));
    }
    layer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw::ParseContext;
    use dagforge_core::{FlagsConfig, TargetConfig};
    use dagforge_manifest::{Macro, ParseFileType};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn ctx() -> ParseContext {
        let mut vars = BTreeMap::new();
        vars.insert("mat".to_string(), json!("incremental"));
        ParseContext::new("shop", TargetConfig::default(), FlagsConfig::default()).with_package_vars("shop", vars)
    }

    fn model_file(path: &str, sql: &str) -> SourceFile {
        SourceFile::new("shop", path, "models", ParseFileType::Model, sql)
    }

    #[test]
    fn sql_node_reads_refs_sources_and_inline_config() {
        let sql = "{{ config(materialized=var('mat'), tags=['nightly']) }}\n\
                   select * from {{ ref('stg_orders') }} join {{ source('raw', 'payments') }} using (id)\n\
                   where {{ cents('amount') }} > 0";
        let file = model_file("models/marts/orders.sql", sql);
        let (parsed, _) = parse_sql_node(&ctx().renderer_for("shop"), &file, ResourceType::Model, "orders", sql).unwrap();

        assert_eq!(parsed.node.unique_id, "model.shop.orders");
        assert_eq!(parsed.node.fqn, vec!["shop", "marts", "orders"]);
        assert_eq!(parsed.node.path, "marts/orders.sql");
        assert_eq!(parsed.node.refs, vec![RefArgs::new("stg_orders")]);
        assert_eq!(parsed.node.sources, vec![("raw".to_string(), "payments".to_string())]);
        assert_eq!(parsed.node.macro_calls, vec!["cents"]);
        assert_eq!(parsed.inline_config["materialized"], json!("incremental"));
        assert_eq!(parsed.unrendered_inline["materialized"], json!("var('mat')"));
        assert_eq!(parsed.inline_config["tags"], json!(["nightly"]));
    }

    #[test]
    fn template_errors_carry_the_file() {
        let sql = "select {{ ref('a') ";
        let file = model_file("models/a.sql", sql);
        let err = parse_sql_node(&ctx().renderer_for("shop"), &file, ResourceType::Model, "a", sql).unwrap_err();
        assert_eq!(err.code(), DiagnosticCode::TemplateSyntaxError);
        assert_eq!(err.to_diagnostic().location.unwrap().file, "models/a.sql");
    }

    #[test]
    fn python_models_keep_literal_config() {
        let file = SourceFile::new(
            "shop",
            "models/forecast.py",
            "models",
            ParseFileType::Model,
            "def model(dbt, session):\n    dbt.config(materialized='incremental')\n    return dbt.ref('orders')\n",
        );
        let parsed = parse_python_node(&file, "forecast").unwrap();
        assert_eq!(parsed.node.language, Language::Python);
        assert_eq!(parsed.node.refs, vec![RefArgs::new("orders")]);
        assert_eq!(parsed.inline_config["materialized"], json!("incremental"));
    }

    #[test]
    fn versions_bind_and_columns_follow_include_exclude() {
        let patch: NodePatchEntry = serde_json::from_value(json!({
            "name": "dim_customers",
            "columns": [{"name": "id"}, {"name": "email"}, {"name": "country"}],
            "versions": [
                {"v": 1, "columns": [{"include": "all", "exclude": ["country"]}]},
                {"v": 2, "defined_in": "dim_customers_next", "columns": [{"name": "region", "data_type": "text"}]}
            ]
        }))
        .unwrap();

        assert_eq!(match_version(&patch, "dim_customers_v1").unwrap().version(), "1");
        assert_eq!(match_version(&patch, "dim_customers_next").unwrap().version(), "2");
        assert!(match_version(&patch, "dim_customers_v2").is_none());
        assert_eq!(latest_version(&patch, "models/schema.yml").unwrap(), "2");

        let file = model_file("models/dim_customers_v1.sql", "select 1");
        let mut node = base_node(&file, ResourceType::Model, "dim_customers_v1");
        bind_version(&mut node, "dim_customers", "1", "2");
        apply_patch(&mut node, &patch, patch.versions.first(), "shop://models/schema.yml");
        assert_eq!(node.unique_id, "model.shop.dim_customers.v1");
        assert_eq!(node.fqn, vec!["shop", "dim_customers", "v1"]);
        assert!(!node.is_latest_version());
        assert_eq!(node.columns.keys().collect::<Vec<_>>(), vec!["email", "id"]);
        assert_eq!(default_alias(&node, None), "dim_customers_v1");

        let mut v2 = base_node(&file, ResourceType::Model, "dim_customers_next");
        bind_version(&mut v2, "dim_customers", "2", "2");
        apply_patch(&mut v2, &patch, patch.versions.get(1), "shop://models/schema.yml");
        assert_eq!(v2.columns.len(), 4);
        assert_eq!(v2.columns["region"].data_type.as_deref(), Some("text"));
    }

    #[test]
    fn undeclared_latest_version_is_an_error() {
        let patch: NodePatchEntry = serde_json::from_value(json!({
            "name": "m", "latest_version": 3, "versions": [{"v": 1}, {"v": 2}]
        }))
        .unwrap();
        let err = latest_version(&patch, "models/schema.yml").unwrap_err();
        assert_eq!(err.code(), DiagnosticCode::VersionedModelInvalid);
        assert_eq!(compare_versions("10", "9"), std::cmp::Ordering::Greater);
    }

    #[test]
    fn native_and_overridden_names() {
        let target = TargetConfig {
            schema: "analytics".to_string(),
            database: Some("warehouse".to_string()),
            ..TargetConfig::default()
        };
        let mut manifest = Manifest::default();
        let mut staged = Node::new(ResourceType::Model, "shop", "stg", "models/stg.sql");
        staged.config.schema = Some("staging".to_string());
        manifest.add_node(staged).unwrap();
        manifest
            .add_node(Node::new(ResourceType::Model, "shop", "orders", "models/orders.sql"))
            .unwrap();

        let resolve = ResolveContext::new("shop");
        assert!(generate_names(&mut manifest, &target, &resolve).is_empty());
        assert_eq!(manifest.nodes["model.shop.stg"].schema, "analytics_staging");
        assert_eq!(manifest.nodes["model.shop.orders"].schema, "analytics");
        assert_eq!(manifest.nodes["model.shop.orders"].database.as_deref(), Some("warehouse"));

        manifest
            .add_macro(Macro::new(
                "shop",
                "generate_schema_name",
                "macros/naming.sql",
                "{% macro generate_schema_name(custom_schema_name, node) %}\
                 {% if custom_schema_name %}{{ custom_schema_name }}{% else %}{{ target.schema }}{% endif %}\
                 {% endmacro %}",
            ))
            .unwrap();
        assert!(generate_names(&mut manifest, &target, &resolve).is_empty());
        assert_eq!(manifest.nodes["model.shop.stg"].schema, "staging");
        assert_eq!(manifest.nodes["model.shop.orders"].schema, "analytics");
    }
}
