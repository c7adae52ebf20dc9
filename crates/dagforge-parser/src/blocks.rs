//! Top-level block extraction
//!
//! Macro, test, materialization, snapshot and docs blocks are pulled out of a
//! file by walking the parsed template. Test and materialization blocks are
//! rewritten as plain macros so every macro-like block is stored the same way.

use dagforge_jinja::{parse, JinjaError, Param, ResourceBlockKind, Stmt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Macro,
    Test,
    Materialization,
    Snapshot,
    Docs,
}

impl BlockKind {
    fn from_resource(kind: ResourceBlockKind) -> Self {
        match kind {
            ResourceBlockKind::Snapshot => BlockKind::Snapshot,
            ResourceBlockKind::Test => BlockKind::Test,
            ResourceBlockKind::Materialization => BlockKind::Materialization,
            ResourceBlockKind::Docs => BlockKind::Docs,
        }
    }

    /// Blocks stored as macros
    pub fn is_macro_like(&self) -> bool {
        matches!(self, BlockKind::Macro | BlockKind::Test | BlockKind::Materialization)
    }
}

/// One top-level block
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub kind: BlockKind,
    /// Macro name for macro-like blocks (`test_unique`,
    /// `materialization_table_default`); the declared name otherwise
    pub name: String,
    /// Stored source: the macro definition for macro-like blocks, the block
    /// as written otherwise
    pub full: String,
    /// Text between the opening and closing tags
    pub body: String,
    pub params: Vec<String>,
    /// Languages a materialization supports, when declared
    pub supported_languages: Option<Vec<String>>,
    pub line: usize,
}

/// Extract the allowed top-level blocks of `source`
pub fn extract_blocks(source: &str, allowed: &[BlockKind]) -> Result<Vec<Block>, JinjaError> {
    let template = parse(source)?;
    let mut blocks = Vec::new();

    for stmt in &template.body {
        let block = match stmt {
            Stmt::Macro {
                name,
                params,
                span,
                body_span,
                ..
            } => Block {
                kind: BlockKind::Macro,
                name: name.clone(),
                full: span.slice(source).to_string(),
                body: body_span.slice(source).to_string(),
                params: params.iter().map(|p| p.name.clone()).collect(),
                supported_languages: None,
                line: span.line_col(source).0,
            },
            Stmt::Resource {
                kind,
                name,
                params,
                kwargs,
                span,
                body_span,
                ..
            } => {
                let kind = BlockKind::from_resource(*kind);
                let body = body_span.slice(source).to_string();
                let (macro_name, full) = match kind {
                    BlockKind::Test => {
                        let macro_name = format!("test_{}", name);
                        let full = macro_definition(&macro_name, params, &body);
                        (macro_name, full)
                    }
                    BlockKind::Materialization => {
                        let adapter = kwargs
                            .iter()
                            .find(|(k, _)| k == "adapter")
                            .and_then(|(_, v)| v.as_str_const())
                            .unwrap_or("default");
                        let macro_name = format!("materialization_{}_{}", name, adapter);
                        let full = macro_definition(&macro_name, &[], &body);
                        (macro_name, full)
                    }
                    _ => (name.clone(), span.slice(source).to_string()),
                };
                let supported_languages = kwargs
                    .iter()
                    .find(|(k, _)| k == "supported_languages")
                    .and_then(|(_, v)| v.to_literal_json())
                    .and_then(|v| serde_json::from_value::<Vec<String>>(v).ok());
                Block {
                    kind,
                    name: macro_name,
                    full,
                    body,
                    params: params.iter().map(|p| p.name.clone()).collect(),
                    supported_languages,
                    line: span.line_col(source).0,
                }
            }
            _ => continue,
        };

        if allowed.contains(&block.kind) {
            blocks.push(block);
        } else {
            tracing::debug!(block = %block.name, kind = ?block.kind, "Ignoring block not allowed in this file type");
        }
    }
    Ok(blocks)
}

fn macro_definition(name: &str, params: &[Param], body: &str) -> String {
    let signature = params
        .iter()
        .map(|p| match &p.default {
            Some(default) => format!("{}={}", p.name, default),
            None => p.name.clone(),
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("{{% macro {}({}) %}}{}{{% endmacro %}}", name, signature, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn macros_and_rewritten_blocks() {
        let source = "{% macro cents(col, scale=2) %}round({{ col }} / 100, {{ scale }}){% endmacro %}\n\
                      {% test positive(model, column_name) %}select * from {{ model }} where {{ column_name }} < 0{% endtest %}\n\
                      {% materialization table, adapter='postgres' %}create table {{ this }}{% endmaterialization %}\n\
                      {% docs orders %}All orders{% enddocs %}";
        let blocks = extract_blocks(
            source,
            &[BlockKind::Macro, BlockKind::Test, BlockKind::Materialization],
        )
        .unwrap();

        assert_eq!(
            blocks.iter().map(|b| b.name.as_str()).collect::<Vec<_>>(),
            vec!["cents", "test_positive", "materialization_table_postgres"]
        );
        assert_eq!(blocks[0].params, vec!["col", "scale"]);
        assert_eq!(
            blocks[1].full,
            "{% macro test_positive(model, column_name) %}select * from {{ model }} where {{ column_name }} < 0{% endmacro %}"
        );
        assert_eq!(
            blocks[2].full,
            "{% macro materialization_table_postgres() %}create table {{ this }}{% endmacro %}"
        );
        assert_eq!(blocks[1].line, 2);
    }

    #[test]
    fn default_materialization_and_docs() {
        let source = "{% materialization view, default, supported_languages=['sql'] %}x{% endmaterialization %}\
                      {% docs overview %}\nHello\n{% enddocs %}";
        let blocks = extract_blocks(source, &[BlockKind::Materialization, BlockKind::Docs]).unwrap();
        assert_eq!(blocks[0].name, "materialization_view_default");
        assert_eq!(blocks[0].supported_languages, Some(vec!["sql".to_string()]));
        assert_eq!(blocks[1].kind, BlockKind::Docs);
        assert_eq!(blocks[1].name, "overview");
        assert_eq!(blocks[1].body, "\nHello\n");
    }

    #[test]
    fn syntax_errors_propagate() {
        assert!(extract_blocks("{% macro broken( %}", &[BlockKind::Macro]).is_err());
    }
}
