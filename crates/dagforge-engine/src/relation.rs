//! Quoted relation names exposed to templates as `this`, `ref()` and `source()`

use dagforge_core::QuotingPolicy;
use dagforge_manifest::{Node, SourceDefinition};
use minijinja::value::{Object, Value};
use std::fmt;
use std::sync::Arc;

/// A warehouse relation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub database: Option<String>,
    pub schema: String,
    pub identifier: String,
    pub quote_char: char,
    pub policy: QuotingPolicy,
}

/// Quote character for an adapter type
pub fn quote_char_for(adapter_type: &str) -> char {
    match adapter_type {
        "bigquery" => '`',
        _ => '"',
    }
}

impl Relation {
    pub fn new(database: Option<String>, schema: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            database,
            schema: schema.into(),
            identifier: identifier.into(),
            quote_char: '"',
            policy: QuotingPolicy::default(),
        }
    }

    pub fn with_quoting(mut self, quote_char: char, policy: QuotingPolicy) -> Self {
        self.quote_char = quote_char;
        self.policy = policy;
        self
    }

    /// Relation of a node, honouring a deferred relation when present
    pub fn for_node(node: &Node, deferred: bool) -> Self {
        match (&node.defer_relation, deferred) {
            (Some(defer), true) => Relation::new(defer.database.clone(), &defer.schema, &defer.alias),
            _ => Relation::new(node.database.clone(), &node.schema, &node.alias),
        }
    }

    pub fn for_source(source: &SourceDefinition) -> Self {
        Relation::new(source.database.clone(), &source.schema, &source.identifier)
    }

    fn quote(&self, part: &str, enabled: bool) -> String {
        if enabled {
            format!("{q}{}{q}", part, q = self.quote_char)
        } else {
            part.to_string()
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(database) = self.database.as_deref().filter(|d| !d.is_empty()) {
            write!(f, "{}.", self.quote(database, self.policy.database))?;
        }
        if !self.schema.is_empty() {
            write!(f, "{}.", self.quote(&self.schema, self.policy.schema))?;
        }
        f.write_str(&self.quote(&self.identifier, self.policy.identifier))
    }
}

impl Object for Relation {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        match key.as_str()? {
            "database" => Some(Value::from(self.database.clone())),
            "schema" => Some(Value::from(self.schema.clone())),
            "identifier" | "name" | "table" => Some(Value::from(self.identifier.clone())),
            _ => None,
        }
    }

    fn render(self: &Arc<Self>, f: &mut fmt::Formatter<'_>) -> fmt::Result
    where
        Self: Sized + 'static,
    {
        fmt::Display::fmt(self.as_ref(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minijinja::Environment;

    #[test]
    fn renders_quoted_parts() {
        let rel = Relation::new(Some("analytics".to_string()), "public", "orders");
        assert_eq!(rel.to_string(), "\"analytics\".\"public\".\"orders\"");
        let rel = Relation::new(None, "public", "orders");
        assert_eq!(rel.to_string(), "\"public\".\"orders\"");
    }

    #[test]
    fn quoting_policy_and_quote_char() {
        let policy = QuotingPolicy {
            database: false,
            schema: true,
            identifier: true,
        };
        let rel = Relation::new(Some("proj".to_string()), "ds", "t").with_quoting(quote_char_for("bigquery"), policy);
        assert_eq!(rel.to_string(), "proj.`ds`.`t`");
    }

    #[test]
    fn template_access() {
        let env = Environment::new();
        let rel = Value::from_object(Relation::new(None, "public", "orders"));
        let out = env
            .render_str("{{ this }} {{ this.schema }}.{{ this.identifier }}", minijinja::context! { this => rel })
            .unwrap();
        assert_eq!(out, "\"public\".\"orders\" public.orders");
    }
}
