//! Single-call static parsing
//!
//! Used where a YAML value holds one `ref(...)` or `source(...)` expression,
//! e.g. unit test `given` inputs.

use crate::error::JinjaError;
use crate::inspector::{default_scope, inspect, RefCall};

/// Parse `ref('name')`, `ref('pkg', 'name')` or `ref('name', version=N)`
pub fn statically_parse_ref(input: &str) -> Result<RefCall, JinjaError> {
    let facts = inspect(&format!("{{{{ {} }}}}", input), &default_scope())
        .map_err(|_| JinjaError::InvalidExpression(input.to_string()))?;
    facts
        .refs
        .into_iter()
        .next()
        .ok_or_else(|| JinjaError::InvalidRef(input.to_string()))
}

/// Parse `source('source_name', 'table_name')`
pub fn statically_parse_source(input: &str) -> Result<(String, String), JinjaError> {
    let facts = inspect(&format!("{{{{ {} }}}}", input), &default_scope())
        .map_err(|_| JinjaError::InvalidExpression(input.to_string()))?;
    facts
        .sources
        .into_iter()
        .next()
        .map(|s| (s.source_name, s.table_name))
        .ok_or_else(|| JinjaError::InvalidSource(input.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_refs() {
        assert_eq!(statically_parse_ref("ref('my_model_a')").unwrap(), RefCall::new("my_model_a"));
        assert_eq!(
            statically_parse_ref("ref('package', 'my_model_a', version=3)").unwrap(),
            RefCall::new("my_model_a").with_package("package").with_version("3")
        );
    }

    #[test]
    fn parses_sources() {
        assert_eq!(
            statically_parse_source("source('raw', 'orders')").unwrap(),
            ("raw".to_string(), "orders".to_string())
        );
    }

    #[test]
    fn rejects_bad_input() {
        assert!(matches!(statically_parse_ref("ref('a'"), Err(JinjaError::InvalidExpression(_))));
        assert!(matches!(statically_parse_ref("source('a', 'b')"), Err(JinjaError::InvalidRef(_))));
        assert!(matches!(statically_parse_source("ref('a')"), Err(JinjaError::InvalidSource(_))));
    }
}
