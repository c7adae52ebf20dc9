//! YAML property files
//!
//! A property file is split by top-level section and every entry is decoded
//! on its own, so one bad entry does not hide the rest of the file. String
//! values are rendered with `var()`/`env_var()` before decoding, except for
//! keys that are rendered later (descriptions, hooks, test arguments).

use crate::error::ParseError;
use dagforge_jinja::Renderer;
use dagforge_manifest::{Access, FreshnessThreshold, MacroArgument, Owner};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub type ConfigMap = BTreeMap<String, Value>;

/// Keys whose values are left unrendered at parse time
pub const UNRENDERED_KEYS: &[&str] = &[
    "description",
    "data_tests",
    "tests",
    "pre-hook",
    "post-hook",
    "pre_hook",
    "post_hook",
    "+pre-hook",
    "+post-hook",
    "on-run-start",
    "on-run-end",
    "given",
    "expect",
    "overrides",
];

/// Column entry under a model, seed, snapshot or source table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnEntry {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub data_type: Option<String>,
    #[serde(default)]
    pub meta: ConfigMap,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub quote: Option<bool>,
    #[serde(default)]
    pub constraints: Vec<Value>,
    #[serde(default, alias = "tests")]
    pub data_tests: Vec<Value>,
    #[serde(default)]
    pub config: ConfigMap,
    #[serde(default)]
    pub granularity: Option<String>,
}

/// One entry of a model's `versions:` list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionEntry {
    pub v: Value,
    #[serde(default)]
    pub defined_in: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub config: ConfigMap,
    /// Column overrides plus `include`/`exclude` entries
    #[serde(default)]
    pub columns: Vec<Value>,
    #[serde(default, alias = "tests")]
    pub data_tests: Vec<Value>,
    #[serde(default)]
    pub docs: Option<Value>,
    #[serde(default)]
    pub constraints: Vec<Value>,
    #[serde(default)]
    pub deprecation_date: Option<String>,
    #[serde(default)]
    pub unrendered_config: ConfigMap,
}

impl VersionEntry {
    /// Version as a string: `2`, `2.1` or a label
    pub fn version(&self) -> String {
        version_string(&self.v)
    }
}

/// Normalize a YAML version value to its string form
pub fn version_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// A `models:`, `seeds:`, `snapshots:` or `analyses:` entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodePatchEntry {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: ConfigMap,
    #[serde(default)]
    pub columns: Vec<ColumnEntry>,
    #[serde(default, alias = "tests")]
    pub data_tests: Vec<Value>,
    #[serde(default)]
    pub docs: Option<Value>,
    #[serde(default)]
    pub meta: ConfigMap,
    #[serde(default)]
    pub access: Option<Access>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub versions: Vec<VersionEntry>,
    #[serde(default)]
    pub latest_version: Option<Value>,
    #[serde(default)]
    pub constraints: Vec<Value>,
    #[serde(default)]
    pub deprecation_date: Option<String>,
    #[serde(default)]
    pub time_spine: Option<Value>,
    /// `config:` before rendering
    #[serde(default)]
    pub unrendered_config: ConfigMap,
}

/// A `macros:` entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MacroPatchEntry {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub arguments: Vec<MacroArgument>,
    #[serde(default)]
    pub meta: ConfigMap,
    #[serde(default)]
    pub docs: Option<Value>,
    #[serde(default)]
    pub config: ConfigMap,
}

/// A table under a source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceTableEntry {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub loaded_at_field: Option<String>,
    /// `Some(None)` when freshness is explicitly disabled with `null`
    #[serde(default, deserialize_with = "explicit_null")]
    pub freshness: Option<Option<FreshnessThreshold>>,
    #[serde(default)]
    pub quoting: ConfigMap,
    #[serde(default)]
    pub meta: ConfigMap,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub config: ConfigMap,
    #[serde(default)]
    pub columns: Vec<ColumnEntry>,
    #[serde(default, alias = "tests")]
    pub data_tests: Vec<Value>,
    #[serde(default)]
    pub external: Option<Value>,
    #[serde(default)]
    pub unrendered_config: ConfigMap,
}

/// A `sources:` entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceEntry {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub loader: String,
    #[serde(default)]
    pub loaded_at_field: Option<String>,
    #[serde(default)]
    pub freshness: Option<FreshnessThreshold>,
    #[serde(default)]
    pub quoting: ConfigMap,
    #[serde(default)]
    pub meta: ConfigMap,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub config: ConfigMap,
    #[serde(default)]
    pub overrides: Option<String>,
    #[serde(default)]
    pub tables: Vec<SourceTableEntry>,
    #[serde(default)]
    pub unrendered_config: ConfigMap,
}

/// An `exposures:` entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExposureEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub exposure_type: String,
    pub owner: Owner,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub maturity: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub meta: ConfigMap,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub config: ConfigMap,
}

/// A `metrics:` entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricEntry {
    pub name: String,
    #[serde(default)]
    pub label: String,
    #[serde(rename = "type")]
    pub metric_type: String,
    #[serde(default)]
    pub type_params: Value,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub filter: Option<Value>,
    #[serde(default)]
    pub meta: ConfigMap,
    #[serde(default)]
    pub config: ConfigMap,
}

/// A `groups:` entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupEntry {
    pub name: String,
    pub owner: Owner,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub config: ConfigMap,
}

/// A `semantic_models:` entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticModelEntry {
    pub name: String,
    /// `ref('model')`
    pub model: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub defaults: Option<Value>,
    #[serde(default)]
    pub primary_entity: Option<String>,
    #[serde(default)]
    pub entities: Value,
    #[serde(default)]
    pub dimensions: Value,
    #[serde(default)]
    pub measures: Value,
    #[serde(default)]
    pub config: ConfigMap,
}

/// A `saved_queries:` entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedQueryEntry {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub query_params: Value,
    #[serde(default)]
    pub exports: Value,
    #[serde(default)]
    pub config: ConfigMap,
}

/// `given` input or `expect` block of a unit test
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UnitTestInputEntry {
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub rows: Option<Value>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub fixture: Option<String>,
}

/// A `unit_tests:` entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UnitTestEntry {
    pub name: String,
    pub model: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub given: Vec<UnitTestInputEntry>,
    pub expect: UnitTestInputEntry,
    #[serde(default)]
    pub overrides: Option<Value>,
    #[serde(default)]
    pub config: ConfigMap,
    #[serde(default)]
    pub versions: Option<Value>,
}

/// Decoded property file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertiesFile {
    #[serde(default)]
    pub models: Vec<NodePatchEntry>,
    #[serde(default)]
    pub seeds: Vec<NodePatchEntry>,
    #[serde(default)]
    pub snapshots: Vec<NodePatchEntry>,
    #[serde(default)]
    pub analyses: Vec<NodePatchEntry>,
    #[serde(default)]
    pub macros: Vec<MacroPatchEntry>,
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
    #[serde(default)]
    pub exposures: Vec<ExposureEntry>,
    #[serde(default)]
    pub metrics: Vec<MetricEntry>,
    #[serde(default)]
    pub groups: Vec<GroupEntry>,
    #[serde(default)]
    pub semantic_models: Vec<SemanticModelEntry>,
    #[serde(default)]
    pub saved_queries: Vec<SavedQueryEntry>,
    #[serde(default)]
    pub unit_tests: Vec<UnitTestEntry>,
}

impl PropertiesFile {
    pub fn is_empty(&self) -> bool {
        *self == PropertiesFile::default()
    }
}

/// Parse YAML text into JSON, rejecting duplicate keys
pub fn load_yaml(path: &str, text: &str) -> Result<Value, ParseError> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    let yaml: serde_yaml::Value = serde_yaml::from_str(text).map_err(|e| ParseError::from_yaml(path, &e))?;
    serde_json::to_value(&yaml).map_err(|e| ParseError::Yaml {
        path: path.to_string(),
        message: e.to_string(),
        line: None,
        column: None,
    })
}

/// Render every templated string in `value`, skipping [`UNRENDERED_KEYS`]
pub fn render_strings(value: &mut Value, renderer: &Renderer, path: &str) -> Result<(), ParseError> {
    match value {
        Value::String(s) if Renderer::has_jinja(s) => {
            let rendered = renderer
                .render(s, Some(path))
                .map_err(|e| ParseError::template(path, e))?;
            *value = native_value(&rendered);
        }
        Value::Array(items) => {
            for item in items {
                render_strings(item, renderer, path)?;
            }
        }
        Value::Object(map) => {
            for (key, item) in map.iter_mut() {
                if UNRENDERED_KEYS.contains(&key.as_str()) {
                    continue;
                }
                render_strings(item, renderer, path)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Rendered text back to a typed value where it reads as one
fn native_value(rendered: &str) -> Value {
    let trimmed = rendered.trim();
    match trimmed {
        "true" | "True" => return Value::Bool(true),
        "false" | "False" => return Value::Bool(false),
        "none" | "None" => return Value::Null,
        _ => {}
    }
    if let Ok(n) = trimmed.parse::<i64>() {
        return Value::from(n);
    }
    match trimmed.parse::<f64>() {
        Ok(f) if trimmed.contains('.') => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(rendered.to_string())),
        _ => Value::String(rendered.to_string()),
    }
}

/// Decode a property file
///
/// Syntax errors fail the whole file. Entry errors are returned beside the
/// entries that decoded cleanly.
pub fn parse_properties(
    path: &str,
    text: &str,
    renderer: &Renderer,
) -> Result<(PropertiesFile, Vec<ParseError>), ParseError> {
    let raw = load_yaml(path, text)?;
    let mut file = PropertiesFile::default();
    let mut errors = Vec::new();

    let Value::Object(sections) = raw else {
        if raw.is_null() {
            return Ok((file, errors));
        }
        return Err(ParseError::Validation {
            path: path.to_string(),
            section: "<root>".to_string(),
            entry: "<root>".to_string(),
            message: "expected a mapping at the top level".to_string(),
        });
    };

    for (section, entries) in sections {
        let decoded = match section.as_str() {
            "models" => decode_section(path, &section, &entries, renderer, &mut errors).map(|v| file.models = v),
            "seeds" => decode_section(path, &section, &entries, renderer, &mut errors).map(|v| file.seeds = v),
            "snapshots" => decode_section(path, &section, &entries, renderer, &mut errors).map(|v| file.snapshots = v),
            "analyses" => decode_section(path, &section, &entries, renderer, &mut errors).map(|v| file.analyses = v),
            "macros" => decode_section(path, &section, &entries, renderer, &mut errors).map(|v| file.macros = v),
            "sources" => decode_section(path, &section, &entries, renderer, &mut errors).map(|v| file.sources = v),
            "exposures" => decode_section(path, &section, &entries, renderer, &mut errors).map(|v| file.exposures = v),
            "metrics" => decode_section(path, &section, &entries, renderer, &mut errors).map(|v| file.metrics = v),
            "groups" => decode_section(path, &section, &entries, renderer, &mut errors).map(|v| file.groups = v),
            "semantic_models" => {
                decode_section(path, &section, &entries, renderer, &mut errors).map(|v| file.semantic_models = v)
            }
            "saved_queries" => {
                decode_section(path, &section, &entries, renderer, &mut errors).map(|v| file.saved_queries = v)
            }
            "unit_tests" => decode_section(path, &section, &entries, renderer, &mut errors).map(|v| file.unit_tests = v),
            "version" => Ok(()),
            other => {
                tracing::debug!(path, section = other, "Ignoring unknown top-level key");
                Ok(())
            }
        };
        decoded?;
    }

    Ok((file, errors))
}

/// Entry types that keep their pre-render `config:`
trait Entry: DeserializeOwned {
    fn keep_unrendered(&mut self, _raw: &Value) {}
}

impl Entry for NodePatchEntry {
    fn keep_unrendered(&mut self, raw: &Value) {
        self.unrendered_config = config_of(raw);
        let raw_versions = raw.get("versions").and_then(Value::as_array);
        for (i, version) in self.versions.iter_mut().enumerate() {
            version.unrendered_config = raw_versions.and_then(|v| v.get(i)).map(config_of).unwrap_or_default();
        }
    }
}

impl Entry for SourceEntry {
    fn keep_unrendered(&mut self, raw: &Value) {
        self.unrendered_config = config_of(raw);
        let raw_tables = raw.get("tables").and_then(Value::as_array);
        for (i, table) in self.tables.iter_mut().enumerate() {
            table.unrendered_config = raw_tables.and_then(|t| t.get(i)).map(config_of).unwrap_or_default();
        }
    }
}

impl Entry for MacroPatchEntry {}
impl Entry for ExposureEntry {}
impl Entry for MetricEntry {}
impl Entry for GroupEntry {}
impl Entry for SemanticModelEntry {}
impl Entry for SavedQueryEntry {}
impl Entry for UnitTestEntry {}

fn config_of(raw: &Value) -> ConfigMap {
    raw.get("config")
        .and_then(Value::as_object)
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}

fn decode_section<T: Entry>(
    path: &str,
    section: &str,
    entries: &Value,
    renderer: &Renderer,
    errors: &mut Vec<ParseError>,
) -> Result<Vec<T>, ParseError> {
    let items = match entries {
        Value::Null => return Ok(Vec::new()),
        Value::Array(items) => items,
        _ => {
            errors.push(ParseError::Validation {
                path: path.to_string(),
                section: section.to_string(),
                entry: "<section>".to_string(),
                message: "expected a list".to_string(),
            });
            return Ok(Vec::new());
        }
    };

    let mut out = Vec::new();
    for (index, raw) in items.iter().enumerate() {
        let entry_name = raw
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("#{}", index));

        let mut rendered = raw.clone();
        render_strings(&mut rendered, renderer, path)?;

        match serde_json::from_value::<T>(rendered) {
            Ok(mut entry) => {
                entry.keep_unrendered(raw);
                out.push(entry);
            }
            Err(e) => errors.push(ParseError::Validation {
                path: path.to_string(),
                section: section.to_string(),
                entry: entry_name,
                message: e.to_string(),
            }),
        }
    }
    Ok(out)
}

/// Distinguish a missing key from an explicit `null`
fn explicit_null<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagforge_jinja::RenderContext;
    use pretty_assertions::assert_eq;

    fn renderer() -> Renderer {
        let mut vars = BTreeMap::new();
        vars.insert("raw_schema".to_string(), Value::from("landing"));
        Renderer::new(RenderContext::default().with_vars(&vars))
    }

    #[test]
    fn decodes_sections_and_renders_values() {
        let text = r#"
version: 2
models:
  - name: orders
    description: "Orders {{ doc('orders') }}"
    config:
      materialized: table
      schema: "{{ var('raw_schema') }}"
    columns:
      - name: id
        data_tests: [unique, not_null]
sources:
  - name: raw
    schema: "{{ var('raw_schema') }}"
    tables:
      - name: orders
        freshness: null
groups:
  - name: finance
    owner: {name: Finance}
"#;
        let (file, errors) = parse_properties("models/schema.yml", text, &renderer()).unwrap();
        assert!(errors.is_empty());

        let orders = &file.models[0];
        assert_eq!(orders.description, "Orders {{ doc('orders') }}");
        assert_eq!(orders.config["schema"], Value::from("landing"));
        assert_eq!(orders.unrendered_config["schema"], Value::from("{{ var('raw_schema') }}"));
        assert_eq!(orders.columns[0].data_tests.len(), 2);

        assert_eq!(file.sources[0].schema.as_deref(), Some("landing"));
        assert_eq!(file.sources[0].tables[0].freshness, Some(None));
        assert_eq!(file.groups[0].owner.name.as_deref(), Some("Finance"));
    }

    #[test]
    fn bad_entries_are_reported_individually() {
        let text = r#"
groups:
  - name: finance
    owner: {name: Finance}
    colour: blue
  - name: marketing
    owner: {email: m@example.com}
"#;
        let (file, errors) = parse_properties("models/groups.yml", text, &renderer()).unwrap();
        assert_eq!(file.groups.len(), 1);
        assert_eq!(file.groups[0].name, "marketing");
        assert_eq!(errors.len(), 1);
        match &errors[0] {
            ParseError::Validation { section, entry, .. } => {
                assert_eq!(section, "groups");
                assert_eq!(entry, "finance");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn duplicate_keys_fail_the_file() {
        let text = "models:\n  - name: a\n    description: x\n    description: y\n";
        let err = parse_properties("models/schema.yml", text, &renderer()).unwrap_err();
        assert!(matches!(err, ParseError::DuplicateYamlKey { .. }));
    }

    #[test]
    fn rendered_scalars_keep_their_type() {
        assert_eq!(native_value("true"), Value::Bool(true));
        assert_eq!(native_value(" 12 "), Value::from(12));
        assert_eq!(native_value("1.5"), Value::from(1.5));
        assert_eq!(native_value("analytics"), Value::from("analytics"));
    }
}
