//! Config layering
//!
//! Node configs are merged from, lowest to highest precedence: the owning
//! package's project file, the root project file, YAML properties, and the
//! inline `config()` call. Keys merge by kind: `tags` and hooks append,
//! dict-valued keys such as `meta` update, everything else is replaced.

use crate::error::ParseError;
use crate::project::{Project, ProjectTree};
use crate::yaml::ConfigMap;
use dagforge_manifest::{NodeConfig, ResourceType};
use serde_json::Value;

/// Keys whose values are concatenated across layers
pub const APPEND_KEYS: &[&str] = &["tags", "pre-hook", "post-hook"];

/// Keys whose dict values are merged across layers
pub const UPDATE_KEYS: &[&str] = &["meta", "quoting", "column_types", "docs", "contract", "persist_docs"];

/// Canonical spelling of a config key
pub fn normalize_key(key: &str) -> String {
    let key = key.trim_start_matches('+');
    match key {
        "pre_hook" => "pre-hook".to_string(),
        "post_hook" => "post-hook".to_string(),
        other => other.to_string(),
    }
}

fn as_list(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

/// Merge `update` over `base`
pub fn merge_into(base: &mut ConfigMap, update: &ConfigMap) {
    for (raw_key, value) in update {
        let key = normalize_key(raw_key);
        if APPEND_KEYS.contains(&key.as_str()) {
            let mut items = base.remove(&key).map(as_list).unwrap_or_default();
            for item in as_list(value.clone()) {
                if key != "tags" || !items.contains(&item) {
                    items.push(item);
                }
            }
            base.insert(key, Value::Array(items));
        } else if UPDATE_KEYS.contains(&key.as_str()) || key == "grants" {
            merge_dict(base, &key, value);
        } else {
            base.insert(key, value.clone());
        }
    }
}

fn merge_dict(base: &mut ConfigMap, key: &str, value: &Value) {
    let Value::Object(update) = value else {
        base.insert(key.to_string(), value.clone());
        return;
    };
    let mut merged = match base.remove(key) {
        Some(Value::Object(existing)) => existing,
        _ => serde_json::Map::new(),
    };
    for (k, v) in update {
        // `+role: [...]` under grants extends the inherited list
        if key == "grants" {
            if let Some(stripped) = k.strip_prefix('+') {
                let mut items = merged.remove(stripped).map(as_list).unwrap_or_default();
                items.extend(as_list(v.clone()));
                merged.insert(stripped.to_string(), Value::Array(items));
                continue;
            }
        }
        merged.insert(k.clone(), v.clone());
    }
    base.insert(key.to_string(), Value::Object(merged));
}

fn is_config_entry(key: &str, value: &Value) -> bool {
    if key.starts_with('+') || !value.is_object() {
        return true;
    }
    let key = normalize_key(key);
    UPDATE_KEYS.contains(&key.as_str()) || key == "grants"
}

/// Config from a project-file tree for a node at `fqn`
///
/// The top level applies to everything, then each nested mapping keyed by the
/// next fqn segment narrows the match.
pub fn project_config(tree: &Value, fqn: &[String]) -> ConfigMap {
    let mut config = ConfigMap::new();
    let mut level = tree;
    let mut depth = 0;
    loop {
        let Value::Object(map) = level else { break };
        let layer: ConfigMap = map
            .iter()
            .filter(|(k, v)| is_config_entry(k, v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        merge_into(&mut config, &layer);

        let Some(segment) = fqn.get(depth) else { break };
        match map.get(segment) {
            Some(next) if next.is_object() => {
                level = next;
                depth += 1;
            }
            _ => break,
        }
    }
    config
}

/// Layered rendered and unrendered config for one node
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayeredConfig {
    pub rendered: ConfigMap,
    pub unrendered: ConfigMap,
}

impl LayeredConfig {
    /// Start from the project-file layers for `package`
    pub fn from_projects(tree: &ProjectTree, package: &str, resource_type: ResourceType, fqn: &[String]) -> Self {
        let mut layered = Self::default();
        let mut projects: Vec<&Project> = Vec::new();
        if let Some(own) = tree.get(package) {
            projects.push(own);
        }
        if package != tree.root_name() {
            projects.push(&tree.root);
        }
        for project in projects {
            merge_into(&mut layered.rendered, &project_config(project.config_tree(resource_type, true), fqn));
            merge_into(
                &mut layered.unrendered,
                &project_config(project.config_tree(resource_type, false), fqn),
            );
        }
        layered
    }

    /// Apply a higher-precedence layer
    pub fn apply(&mut self, rendered: &ConfigMap, unrendered: &ConfigMap) {
        merge_into(&mut self.rendered, rendered);
        merge_into(&mut self.unrendered, unrendered);
    }

    /// Apply a layer that is the same before and after rendering
    pub fn apply_literal(&mut self, layer: &ConfigMap) {
        self.apply(layer, layer);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.rendered.get(key)
    }
}

/// Build a typed config from a merged map
pub fn build_node_config(merged: &ConfigMap, path: &str) -> Result<NodeConfig, ParseError> {
    let mut map = serde_json::Map::new();
    for (key, value) in merged {
        let value = match key.as_str() {
            "pre-hook" | "post-hook" => Value::Array(as_list(value.clone()).into_iter().map(hook_object).collect()),
            "tags" => Value::Array(as_list(value.clone())),
            _ => value.clone(),
        };
        map.insert(key.clone(), value);
    }
    serde_json::from_value(Value::Object(map)).map_err(|e| ParseError::Config {
        path: path.to_string(),
        message: e.to_string(),
    })
}

fn hook_object(hook: Value) -> Value {
    match hook {
        Value::String(sql) => serde_json::json!({ "sql": sql, "transaction": true }),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn map(value: Value) -> ConfigMap {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn append_update_and_clobber() {
        let mut base = map(json!({
            "tags": ["nightly"],
            "meta": {"owner": "data"},
            "materialized": "view",
            "grants": {"select": ["reporter"]}
        }));
        merge_into(
            &mut base,
            &map(json!({
                "+tags": "finance",
                "meta": {"tier": 1},
                "+materialized": "table",
                "grants": {"+select": ["auditor"]},
                "pre_hook": "grant usage"
            })),
        );
        assert_eq!(base["tags"], json!(["nightly", "finance"]));
        assert_eq!(base["meta"], json!({"owner": "data", "tier": 1}));
        assert_eq!(base["materialized"], json!("table"));
        assert_eq!(base["grants"], json!({"select": ["reporter", "auditor"]}));
        assert_eq!(base["pre-hook"], json!(["grant usage"]));
    }

    #[test]
    fn project_tree_narrows_by_fqn() {
        let tree = json!({
            "+persist_docs": {"relation": true},
            "shop": {
                "+materialized": "view",
                "marts": {
                    "+materialized": "table",
                    "+tags": ["marts"],
                    "finance": {"+schema": "finance"}
                },
                "staging": {"+tags": "staging"}
            }
        });
        let fqn: Vec<String> = ["shop", "marts", "revenue"].iter().map(|s| s.to_string()).collect();
        let config = project_config(&tree, &fqn);
        assert_eq!(config["materialized"], json!("table"));
        assert_eq!(config["tags"], json!(["marts"]));
        assert_eq!(config["persist_docs"], json!({"relation": true}));
        assert!(!config.contains_key("schema"));
    }

    #[test]
    fn typed_config_from_merged_map() {
        let merged = map(json!({
            "materialized": "incremental",
            "tags": "nightly",
            "post-hook": ["analyze {{ this }}"],
            "access": "private",
            "group": "finance",
            "custom_flag": 3
        }));
        let config = build_node_config(&merged, "models/a.sql").unwrap();
        assert_eq!(config.materialized, "incremental");
        assert_eq!(config.tags, vec!["nightly"]);
        assert_eq!(config.post_hook[0].sql, "analyze {{ this }}");
        assert!(config.post_hook[0].transaction);
        assert_eq!(config.access, dagforge_manifest::Access::Private);
        assert_eq!(config.extra["custom_flag"], json!(3));

        let bad = map(json!({"enabled": "sometimes"}));
        assert!(matches!(
            build_node_config(&bad, "models/a.sql"),
            Err(ParseError::Config { .. })
        ));
    }
}
