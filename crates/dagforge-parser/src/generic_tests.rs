//! Generic tests declared in property files
//!
//! `data_tests:` entries on models, columns, sources and source tables become
//! test nodes that call the `test_<name>` macro with the target relation.

use crate::error::ParseError;
use crate::yaml::ConfigMap;
use dagforge_core::sha256_hex;
use dagforge_jinja::{statically_parse_ref, statically_parse_source};
use dagforge_manifest::{unique_id, Node, RefArgs, ResourceType, TestMetadata};
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::LazyLock;

static UNSAFE_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^0-9a-zA-Z_]+").expect("valid test name regex"));

/// Keys read as test config when written beside the test arguments
pub const TEST_CONFIG_KEYS: &[&str] = &[
    "severity",
    "tags",
    "where",
    "enabled",
    "warn_if",
    "error_if",
    "limit",
    "store_failures",
    "store_failures_as",
    "meta",
    "alias",
    "schema",
    "database",
    "fail_calc",
];

/// Longest test name kept as is
const MAX_NAME_LEN: usize = 63;

/// What a test is attached to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestTarget {
    Model {
        name: String,
        version: Option<String>,
        resource_type: ResourceType,
    },
    Source {
        source_name: String,
        table: String,
    },
}

impl TestTarget {
    pub fn model(name: impl Into<String>) -> Self {
        TestTarget::Model {
            name: name.into(),
            version: None,
            resource_type: ResourceType::Model,
        }
    }

    /// Name used in the synthesized test name
    fn label(&self) -> String {
        match self {
            TestTarget::Model {
                name,
                version: Some(v),
                ..
            } => format!("{}_v{}", name, v),
            TestTarget::Model { name, .. } => name.clone(),
            TestTarget::Source { source_name, table } => format!("{}_{}", source_name, table),
        }
    }

    /// Jinja expression for the target relation
    fn expression(&self) -> String {
        match self {
            TestTarget::Model {
                name,
                version: Some(v),
                ..
            } => format!("ref('{}', v={})", name, quote_version(v)),
            TestTarget::Model { name, .. } => format!("ref('{}')", name),
            TestTarget::Source { source_name, table } => format!("source('{}', '{}')", source_name, table),
        }
    }
}

fn quote_version(v: &str) -> String {
    if v.parse::<f64>().is_ok() {
        v.to_string()
    } else {
        format!("'{}'", v)
    }
}

/// One `data_tests:` entry, normalized
#[derive(Debug, Clone, PartialEq)]
pub struct TestEntry {
    pub test_name: String,
    pub namespace: Option<String>,
    pub custom_name: Option<String>,
    pub args: BTreeMap<String, Value>,
    pub config: ConfigMap,
}

impl TestEntry {
    /// Accepts `unique`, `{accepted_values: {values: [...]}}`,
    /// `{accepted_values: {arguments: {...}, config: {...}}}` and
    /// `{test_name: accepted_values, name: custom, ...}`
    pub fn parse(entry: &Value, path: &str) -> Result<Self, ParseError> {
        let invalid = |message: String| ParseError::Validation {
            path: path.to_string(),
            section: "data_tests".to_string(),
            entry: entry.to_string(),
            message,
        };

        let (full_name, body) = match entry {
            Value::String(name) => (name.clone(), serde_json::Map::new()),
            Value::Object(map) if map.contains_key("test_name") => {
                let name = map
                    .get("test_name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| invalid("test_name must be a string".to_string()))?;
                let mut body = map.clone();
                body.remove("test_name");
                (name.to_string(), body)
            }
            Value::Object(map) if map.len() == 1 => {
                let (name, body) = map.iter().next().ok_or_else(|| invalid("empty test".to_string()))?;
                let body = match body {
                    Value::Object(body) => body.clone(),
                    Value::Null => serde_json::Map::new(),
                    _ => return Err(invalid("test arguments must be a mapping".to_string())),
                };
                (name.clone(), body)
            }
            _ => return Err(invalid("expected a test name or a single-key mapping".to_string())),
        };

        let (namespace, test_name) = match full_name.split_once('.') {
            Some((ns, name)) => (Some(ns.to_string()), name.to_string()),
            None => (None, full_name.clone()),
        };

        let mut config: ConfigMap = match body.get("config") {
            Some(Value::Object(c)) => c.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            Some(Value::Null) | None => ConfigMap::new(),
            Some(_) => return Err(invalid("config must be a mapping".to_string())),
        };
        let custom_name = body.get("name").and_then(Value::as_str).map(str::to_string);

        let mut args = BTreeMap::new();
        if let Some(Value::Object(arguments)) = body.get("arguments") {
            args.extend(arguments.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        for (key, value) in &body {
            match key.as_str() {
                "config" | "name" | "arguments" => {}
                k if TEST_CONFIG_KEYS.contains(&k) => {
                    if config.contains_key(k) {
                        return Err(ParseError::TestConfigConflict {
                            path: path.to_string(),
                            test: full_name.clone(),
                            key: k.to_string(),
                        });
                    }
                    config.insert(k.to_string(), value.clone());
                }
                _ => {
                    args.insert(key.clone(), value.clone());
                }
            }
        }

        Ok(Self {
            test_name,
            namespace,
            custom_name,
            args,
            config,
        })
    }

    /// Macro called by the test: `test_unique` or `dbt_utils.test_unique`
    pub fn macro_name(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}.test_{}", ns, self.test_name),
            None => format!("test_{}", self.test_name),
        }
    }
}

/// `(short_name, full_name)` for a test on `target` with `args`
pub fn synthesize_name(entry: &TestEntry, target: &TestTarget, args: &BTreeMap<String, Value>) -> (String, String) {
    let mut flat = Vec::new();
    for (key, value) in args {
        if key == "model" {
            continue;
        }
        match value {
            Value::Object(map) => flat.extend(map.values().map(arg_text)),
            Value::Array(items) => flat.extend(items.iter().map(arg_text)),
            other => flat.push(arg_text(other)),
        }
    }
    let unique = flat
        .iter()
        .map(|part| UNSAFE_CHARS.replace_all(part, "_").into_owned())
        .collect::<Vec<_>>()
        .join("__");

    let mut test_type = match &entry.namespace {
        Some(ns) => format!("{}_{}", ns, entry.test_name),
        None => entry.test_name.clone(),
    };
    if matches!(target, TestTarget::Source { .. }) {
        test_type = format!("source_{}", test_type);
    }
    let identifier = format!("{}_{}", test_type, target.label());
    let full_name = if unique.is_empty() {
        identifier.clone()
    } else {
        format!("{}_{}", identifier, unique)
    };

    let short_name = match &entry.custom_name {
        Some(name) => name.clone(),
        None if full_name.len() > MAX_NAME_LEN => {
            let prefix: String = identifier.chars().take(30).collect();
            format!("{}_{}", prefix, &sha256_hex(&full_name)[..32])
        }
        None => full_name.clone(),
    };
    (short_name, full_name)
}

fn arg_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Null => "None".to_string(),
        other => other.to_string(),
    }
}

/// A test node before config layering
#[derive(Debug, Clone, PartialEq)]
pub struct GenericTest {
    pub node: Node,
    /// Config written on the test itself
    pub config: ConfigMap,
}

/// Build a test node for one `data_tests:` entry
pub fn build_generic_test(
    package: &str,
    path: &str,
    subdirectories: &[String],
    target: &TestTarget,
    column_name: Option<&str>,
    entry: &Value,
) -> Result<GenericTest, ParseError> {
    let parsed = TestEntry::parse(entry, path)?;

    let mut kwargs = parsed.args.clone();
    if let Some(column) = column_name {
        kwargs.insert("column_name".to_string(), Value::String(column.to_string()));
    }
    let (short_name, full_name) = synthesize_name(&parsed, target, &kwargs);

    let mut node = Node::new(ResourceType::Test, package, &short_name, path);
    node.unique_id = format!(
        "{}.{}",
        unique_id(ResourceType::Test, package, &short_name, None),
        &sha256_hex(format!("{}|{}", full_name, path))[..10]
    );
    node.path = format!("{}.sql", short_name);
    node.fqn = std::iter::once(package.to_string())
        .chain(subdirectories.iter().cloned())
        .chain(std::iter::once(short_name.clone()))
        .collect();
    node.column_name = column_name.map(str::to_string);

    match target {
        TestTarget::Model { name, version, .. } => {
            let mut target_ref = RefArgs::new(name);
            if let Some(v) = version {
                target_ref = target_ref.with_version(v);
            }
            node.refs.push(target_ref);
        }
        TestTarget::Source { source_name, table } => node.sources.push((source_name.clone(), table.clone())),
    }

    // ref()/source() written as argument values become dependencies
    let mut call_args = vec![format!("model={}", target.expression())];
    for (key, value) in &kwargs {
        let rendered = match value.as_str() {
            Some(text) if text.trim_start().starts_with("ref(") => match statically_parse_ref(text) {
                Ok(call) => {
                    let mut dep = RefArgs::new(&call.name);
                    if let Some(p) = &call.package {
                        dep = dep.with_package(p);
                    }
                    if let Some(v) = &call.version {
                        dep = dep.with_version(v);
                    }
                    node.refs.push(dep);
                    text.to_string()
                }
                Err(_) => jinja_literal(value),
            },
            Some(text) if text.trim_start().starts_with("source(") => match statically_parse_source(text) {
                Ok(pair) => {
                    node.sources.push(pair);
                    text.to_string()
                }
                Err(_) => jinja_literal(value),
            },
            _ => jinja_literal(value),
        };
        call_args.push(format!("{}={}", key, rendered));
    }
    node.raw_code = format!("{{{{ {}({}) }}}}", parsed.macro_name(), call_args.join(", "));
    node.checksum = dagforge_core::FileHash::from_contents(&node.raw_code);
    node.macro_calls.push(parsed.macro_name());
    node.test_metadata = Some(TestMetadata {
        name: parsed.test_name.clone(),
        kwargs,
        namespace: parsed.namespace.clone(),
    });

    Ok(GenericTest {
        node,
        config: parsed.config,
    })
}

/// A JSON value written as a Jinja literal
fn jinja_literal(value: &Value) -> String {
    match value {
        Value::Null => "none".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
        Value::Array(items) => format!("[{}]", items.iter().map(jinja_literal).collect::<Vec<_>>().join(", ")),
        Value::Object(map) => format!(
            "{{{}}}",
            map.iter()
                .map(|(k, v)| format!("{}: {}", jinja_literal(&Value::String(k.clone())), jinja_literal(v)))
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn build(target: &TestTarget, column: Option<&str>, entry: Value) -> GenericTest {
        build_generic_test("shop", "models/schema.yml", &[], target, column, &entry).unwrap()
    }

    #[test]
    fn column_tests_get_conventional_names() {
        let test = build(&TestTarget::model("orders"), Some("id"), json!("not_null"));
        assert_eq!(test.node.name, "not_null_orders_id");
        assert!(test.node.unique_id.starts_with("test.shop.not_null_orders_id."));
        assert_eq!(test.node.path, "not_null_orders_id.sql");
        assert_eq!(test.node.refs, vec![RefArgs::new("orders")]);
        assert_eq!(test.node.macro_calls, vec!["test_not_null"]);
        assert_eq!(
            test.node.raw_code,
            "{{ test_not_null(model=ref('orders'), column_name='id') }}"
        );
        assert!(test.config.is_empty());

        let test = build(
            &TestTarget::model("orders"),
            Some("status"),
            json!({"accepted_values": {"values": ["placed", "shipped"], "severity": "warn"}}),
        );
        assert_eq!(test.node.name, "accepted_values_orders_status__placed__shipped");
        assert_eq!(test.config["severity"], json!("warn"));
        assert_eq!(
            test.node.test_metadata.as_ref().unwrap().kwargs["values"],
            json!(["placed", "shipped"])
        );
    }

    #[test]
    fn source_tests_and_relationship_refs() {
        let target = TestTarget::Source {
            source_name: "raw".to_string(),
            table: "orders".to_string(),
        };
        let test = build(
            &target,
            Some("customer_id"),
            json!({"relationships": {"arguments": {"to": "ref('customers')", "field": "id"}}}),
        );
        assert_eq!(test.node.name, "source_relationships_raw_orders_customer_id__id__ref_customers_");
        assert_eq!(test.node.sources, vec![("raw".to_string(), "orders".to_string())]);
        assert_eq!(test.node.refs, vec![RefArgs::new("customers")]);
        assert!(test.node.raw_code.contains("to=ref('customers')"));
        assert!(test.node.raw_code.contains("model=source('raw', 'orders')"));
    }

    #[test]
    fn long_names_are_hashed_and_namespaces_split() {
        let test = build(
            &TestTarget::model("fct_orders"),
            None,
            json!({"dbt_utils.expression_is_true": {"expression": "amount_in_cents_after_discount >= minimum_order_value_in_cents"}}),
        );
        assert_eq!(test.node.name.len(), 30 + 1 + 32);
        assert!(test.node.name.starts_with("dbt_utils_expression_is_true_f"));
        let meta = test.node.test_metadata.unwrap();
        assert_eq!(meta.namespace.as_deref(), Some("dbt_utils"));
        assert_eq!(meta.name, "expression_is_true");
        assert_eq!(test.node.macro_calls, vec!["dbt_utils.test_expression_is_true"]);
    }

    #[test]
    fn config_conflicts_are_errors() {
        let err = build_generic_test(
            "shop",
            "models/schema.yml",
            &[],
            &TestTarget::model("orders"),
            Some("id"),
            &json!({"unique": {"severity": "warn", "config": {"severity": "error"}}}),
        )
        .unwrap_err();
        assert!(matches!(err, ParseError::TestConfigConflict { ref key, .. } if key == "severity"));
    }

    #[test]
    fn custom_names_win() {
        let test = build(
            &TestTarget::model("orders"),
            Some("id"),
            json!({"test_name": "unique", "name": "orders_id_is_unique"}),
        );
        assert_eq!(test.node.name, "orders_id_is_unique");
        assert_eq!(test.node.test_metadata.unwrap().name, "unique");
    }
}
