//! Render context
//!
//! Values visible to templates while rendering: `target`, project and CLI
//! `vars`, plus per-render extras such as `this` or `sql`.

use dagforge_core::TargetConfig;
use minijinja::Value as MinijinjaValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Context for template rendering
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RenderContext {
    /// Merged project and CLI variables, read through `var()`
    pub vars: BTreeMap<String, serde_json::Value>,

    /// Target profile (dev, prod, etc.)
    pub target: TargetContext,

    /// Extra top-level values (`this`, `sql`, `model`, ...)
    #[serde(flatten)]
    pub values: BTreeMap<String, serde_json::Value>,
}

/// Target context exposed as `target`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetContext {
    pub name: String,
    pub schema: String,
    pub database: Option<String>,
    #[serde(rename = "type")]
    pub target_type: String,
}

impl RenderContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for a target profile
    pub fn for_target(target: &TargetConfig) -> Self {
        Self {
            target: TargetContext::from(target),
            ..Self::default()
        }
    }

    /// Add a variable
    pub fn add_var(&mut self, key: impl Into<String>, value: serde_json::Value) -> &mut Self {
        self.vars.insert(key.into(), value);
        self
    }

    /// Merge variables; later values win
    pub fn with_vars<'a>(mut self, vars: impl IntoIterator<Item = (&'a String, &'a serde_json::Value)>) -> Self {
        for (k, v) in vars {
            self.vars.insert(k.clone(), v.clone());
        }
        self
    }

    /// Add a top-level value
    pub fn with_value(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    /// Convert to MiniJinja value for rendering
    pub fn to_minijinja_value(&self) -> MinijinjaValue {
        MinijinjaValue::from_serialize(self)
    }
}

impl Default for TargetContext {
    fn default() -> Self {
        TargetContext::from(&TargetConfig::default())
    }
}

impl From<&TargetConfig> for TargetContext {
    fn from(target: &TargetConfig) -> Self {
        Self {
            name: target.name.clone(),
            schema: target.schema.clone(),
            database: target.database.clone(),
            target_type: target.adapter_type.clone(),
        }
    }
}

/// Builder for RenderContext
#[derive(Default)]
pub struct RenderContextBuilder {
    context: RenderContext,
}

impl RenderContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn var(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.add_var(key, value);
        self
    }

    pub fn target(mut self, target: &TargetConfig) -> Self {
        self.context.target = TargetContext::from(target);
        self
    }

    pub fn value(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.values.insert(key.into(), value);
        self
    }

    pub fn build(self) -> RenderContext {
        self.context
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_from_config() {
        let mut config = TargetConfig::default();
        config.schema = "analytics".to_string();
        let ctx = RenderContextBuilder::new().target(&config).var("x", serde_json::json!(1)).build();
        assert_eq!(ctx.target.schema, "analytics");
        assert_eq!(ctx.target.target_type, "postgres");
        assert_eq!(ctx.vars["x"], serde_json::json!(1));
    }

    #[test]
    fn extra_values_are_top_level() {
        let ctx = RenderContext::new().with_value("sql", serde_json::json!("select 1"));
        let value = serde_json::to_value(&ctx).unwrap();
        assert_eq!(value["sql"], "select 1");
        assert_eq!(value["target"]["type"], "postgres");
    }
}
